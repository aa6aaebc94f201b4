//! Hierarchical reader/writer locks keyed by metadata object name paths.
//!
//! Acquiring `m.c1.s1` takes READ on the root node, `m` and `m.c1` (in that order) and the
//! requested mode on `m.c1.s1`. A writer on a node therefore excludes every operation on
//! that node and on anything beneath it, while readers of the same path run in parallel.
//! The root node taken in WRITE mode conflicts with every other acquisition.
//!
//! Locks are reentrant per task: nested `with_lock` calls in the same task skip nodes the
//! task already holds in a sufficient mode. Nodes are dropped from the table as soon as
//! nobody holds or waits for them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use strum_macros::Display;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

use crate::error::{Error, Result};
use crate::identifier::NameIdentifier;

const ROOT_KEY: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LockType {
    Read,
    Write,
}

struct HeldLock {
    key: String,
    lock_type: LockType,
}

tokio::task_local! {
    static HELD_LOCKS: RefCell<Vec<HeldLock>>;
}

enum NodeGuard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

#[derive(Default)]
pub struct TreeLock {
    nodes: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

/// Guards acquired by one `with_lock` call, released leaf to root on drop, including
/// when the guarded future panics or is cancelled.
struct AcquiredLocks<'a> {
    tree: &'a TreeLock,
    guards: Vec<(String, NodeGuard)>,
}

impl Drop for AcquiredLocks<'_> {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            let _ = HELD_LOCKS.try_with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|h| h.key == key) {
                    held.remove(pos);
                }
            });
            self.tree.release_node(&key);
        }
    }
}

/// A wait for one node. Dropping it before it completes, as a cancelled task does,
/// lets the node be collected.
struct PendingNode<'a> {
    tree: &'a TreeLock,
    key: &'a str,
    wait: BoxFuture<'static, NodeGuard>,
}

impl<'a> PendingNode<'a> {
    fn new(tree: &'a TreeLock, key: &'a str, lock_type: LockType) -> Self {
        let node = tree.node(key);
        let wait: BoxFuture<'static, NodeGuard> = match lock_type {
            LockType::Read => Box::pin(async move { NodeGuard::Read(node.read_owned().await) }),
            LockType::Write => Box::pin(async move { NodeGuard::Write(node.write_owned().await) }),
        };
        Self { tree, key, wait }
    }
}

impl Future for PendingNode<'_> {
    type Output = NodeGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<NodeGuard> {
        self.wait.as_mut().poll(cx)
    }
}

impl Drop for PendingNode<'_> {
    fn drop(&mut self) {
        // The wait holds a reference to the node until it is dropped
        self.wait = Box::pin(std::future::pending::<NodeGuard>());
        self.tree.release_node(self.key);
    }
}

impl TreeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding `lock_type` on `ident` and READ on all of its ancestors.
    pub async fn with_lock<F, Fut, T>(
        &self,
        ident: &NameIdentifier,
        lock_type: LockType,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let levels = ident.levels();
        let mut path: Vec<String> = Vec::with_capacity(levels.len() + 1);
        path.push(ROOT_KEY.to_string());
        for i in 1..=levels.len() {
            path.push(levels[..i].join("."));
        }
        self.with_path_lock(path, lock_type, f).await
    }

    /// Runs `f` while holding `lock_type` on the root node only.
    pub async fn with_root_lock<F, Fut, T>(&self, lock_type: LockType, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_path_lock(vec![ROOT_KEY.to_string()], lock_type, f)
            .await
    }

    /// Number of live lock nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    async fn with_path_lock<F, Fut, T>(
        &self,
        path: Vec<String>,
        lock_type: LockType,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let locked = async {
            let _acquired = self.acquire(&path, lock_type).await?;
            f().await
        };

        if HELD_LOCKS.try_with(|_| ()).is_ok() {
            locked.await
        } else {
            HELD_LOCKS.scope(RefCell::new(Vec::new()), locked).await
        }
    }

    async fn acquire(&self, path: &[String], lock_type: LockType) -> Result<AcquiredLocks<'_>> {
        let mut acquired = AcquiredLocks {
            tree: self,
            guards: Vec::with_capacity(path.len()),
        };

        let leaf = path.len() - 1;
        for (i, key) in path.iter().enumerate() {
            let wanted = if i == leaf { lock_type } else { LockType::Read };

            let already_held = HELD_LOCKS.with(|held| {
                held.borrow()
                    .iter()
                    .filter(|h| &h.key == key)
                    .map(|h| h.lock_type)
                    .max_by_key(|t| *t == LockType::Write)
            });
            match (already_held, wanted) {
                (Some(LockType::Write), _) | (Some(LockType::Read), LockType::Read) => continue,
                (Some(LockType::Read), LockType::Write) => {
                    return Err(Error::internal(format!(
                        "Cannot upgrade the read lock on {key:?} to a write lock"
                    )));
                }
                (None, _) => {}
            }

            trace!(key, lock_type = %wanted, "Acquiring tree lock node");
            let guard = PendingNode::new(self, key, wanted).await;
            HELD_LOCKS.with(|held| {
                held.borrow_mut().push(HeldLock {
                    key: key.clone(),
                    lock_type: wanted,
                })
            });
            acquired.guards.push((key.clone(), guard));
        }

        Ok(acquired)
    }

    fn node(&self, key: &str) -> Arc<RwLock<()>> {
        self.nodes
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn release_node(&self, key: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(key) {
            // Only the table itself references the node: no holders, no waiters
            if Arc::strong_count(node) == 1 {
                nodes.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn ident(dotted: &str) -> NameIdentifier {
        NameIdentifier::parse(dotted).unwrap()
    }

    #[tokio::test]
    async fn test_nodes_are_collected_after_release() {
        let tree = TreeLock::new();
        let result = tree
            .with_lock(&ident("m.c1.s1"), LockType::Write, || async {
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(tree.node_count(), 0);

        let failed: Result<()> = tree
            .with_lock(&ident("m.c1"), LockType::Read, || async {
                Err(Error::internal("boom"))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_acquisition() {
        let tree = TreeLock::new();
        let result = tree
            .with_lock(&ident("m.c1"), LockType::Write, || async {
                tree.with_lock(&ident("m.c1.s1"), LockType::Write, || async {
                    tree.with_lock(&ident("m.c1"), LockType::Read, || async { Ok(1) })
                        .await
                })
                .await
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test]
    async fn test_read_to_write_upgrade_is_rejected() {
        let tree = TreeLock::new();
        let err = tree
            .with_lock(&ident("m.c1"), LockType::Read, || async {
                tree.with_lock(&ident("m.c1"), LockType::Write, || async { Ok(()) })
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writers_on_same_path_are_exclusive() {
        let tree = Arc::new(TreeLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (tree, inside, max_inside) =
                    (tree.clone(), inside.clone(), max_inside.clone());
                tokio::spawn(async move {
                    tree.with_lock(&ident("m.c1.s1.t1"), LockType::Write, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_share_a_path() {
        let tree = Arc::new(TreeLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (tree, inside, max_inside) =
                    (tree.clone(), inside.clone(), max_inside.clone());
                tokio::spawn(async move {
                    tree.with_lock(&ident("m.c1.s1"), LockType::Read, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(max_inside.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ancestor_writer_blocks_descendant() {
        let tree = Arc::new(TreeLock::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let writer = {
            let tree = tree.clone();
            tokio::spawn(async move {
                tree.with_lock(&ident("m.c1"), LockType::Write, || async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let reader = {
            let tree = tree.clone();
            tokio::spawn(async move {
                tree.with_lock(&ident("m.c1.s1.t1"), LockType::Read, || async { Ok(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        release_tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
        reader.await.unwrap().unwrap();
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_leave_no_nodes() {
        let tree = Arc::new(TreeLock::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let writer = {
            let tree = tree.clone();
            tokio::spawn(async move {
                tree.with_lock(&ident("m.c1"), LockType::Write, || async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let waiter_ident = ident("m.c1");
        let mut waiter = Box::pin(tree.with_lock(&waiter_ident, LockType::Read, || async {
            Ok(())
        }));
        assert!(futures::poll!(&mut waiter).is_pending());

        // The writer lets go while the waiter still references the node, and the waiter
        // is then abandoned before it gets to run
        release_tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
        drop(waiter);
        assert_eq!(tree.node_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_root_write_lock_excludes_everything() {
        let tree = Arc::new(TreeLock::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let root = {
            let tree = tree.clone();
            tokio::spawn(async move {
                tree.with_root_lock(LockType::Write, || async {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    Ok(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let other = {
            let tree = tree.clone();
            tokio::spawn(async move {
                tree.with_lock(&ident("other"), LockType::Read, || async { Ok(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!other.is_finished());

        release_tx.send(()).unwrap();
        root.await.unwrap().unwrap();
        other.await.unwrap().unwrap();
    }
}
