use std::future::Future;

/// Principal name used when no caller identity has been established.
pub const ANONYMOUS_USER: &str = "anonymous";

tokio::task_local! {
    static CURRENT_PRINCIPAL: String;
}

/// Runs `fut` with `principal` as the current caller identity.
pub async fn with_principal<F: Future>(principal: impl Into<String>, fut: F) -> F::Output {
    CURRENT_PRINCIPAL.scope(principal.into(), fut).await
}

pub fn current_principal() -> String {
    CURRENT_PRINCIPAL
        .try_with(|p| p.clone())
        .unwrap_or_else(|_| ANONYMOUS_USER.to_string())
}
