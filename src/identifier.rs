use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;

use crate::data_types::EntityId;

/// Property key under which a [`StringIdentifier`] is embedded into the property bag of an
/// object living in an external system.
pub const ID_KEY: &str = "lakeward.identifier";

const STRING_ID_PREFIX: &str = "lakeward.v1.uid";

/// Ordered path of levels an object lives under, e.g. `["m", "c1", "s1"]` for a table
/// in schema `s1` of catalog `c1` in metalake `m`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Namespace {
    levels: Vec<String>,
}

impl Namespace {
    pub fn empty() -> Self {
        Self { levels: vec![] }
    }

    pub fn of<S: AsRef<str>>(levels: &[S]) -> Self {
        Self {
            levels: levels.iter().map(|l| l.as_ref().to_string()).collect(),
        }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn level(&self, pos: usize) -> Option<&str> {
        self.levels.get(pos).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.iter().join("."))
    }
}

/// Hierarchical name of a metadata object: its namespace plus its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameIdentifier {
    namespace: Namespace,
    name: String,
}

impl NameIdentifier {
    pub fn new(namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Builds an identifier from all of its levels; the last one is the name.
    /// Returns `None` for an empty slice.
    pub fn of<S: AsRef<str>>(levels: &[S]) -> Option<Self> {
        let (name, namespace) = levels.split_last()?;
        Some(Self::new(Namespace::of(namespace), name.as_ref()))
    }

    pub fn of_metalake(metalake: &str) -> Self {
        Self::new(Namespace::empty(), metalake)
    }

    pub fn of_catalog(metalake: &str, catalog: &str) -> Self {
        Self::new(Namespace::of(&[metalake]), catalog)
    }

    pub fn of_schema(metalake: &str, catalog: &str, schema: &str) -> Self {
        Self::new(Namespace::of(&[metalake, catalog]), schema)
    }

    /// Table, topic and fileset identifiers all live directly under a schema.
    pub fn of_leaf(metalake: &str, catalog: &str, schema: &str, name: &str) -> Self {
        Self::new(Namespace::of(&[metalake, catalog, schema]), name)
    }

    pub fn of_user(metalake: &str, user: &str) -> Self {
        Self::new(Namespace::of(&[metalake, "system", "user"]), user)
    }

    pub fn of_group(metalake: &str, group: &str) -> Self {
        Self::new(Namespace::of(&[metalake, "system", "group"]), group)
    }

    pub fn of_role(metalake: &str, role: &str) -> Self {
        Self::new(Namespace::of(&[metalake, "system", "role"]), role)
    }

    /// Parses a dotted name such as `m.c1.s1.t1`.
    pub fn parse(dotted: &str) -> Option<Self> {
        if dotted.is_empty() || dotted.split('.').any(str::is_empty) {
            return None;
        }
        let levels: Vec<&str> = dotted.split('.').collect();
        Self::of(&levels)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// The metalake this identifier is rooted at.
    pub fn metalake(&self) -> &str {
        self.namespace.level(0).unwrap_or(&self.name)
    }

    /// Identifier of the object owning this one's namespace (`m.c1.s1` for `m.c1.s1.t1`).
    pub fn parent(&self) -> Option<NameIdentifier> {
        NameIdentifier::of(self.namespace.levels())
    }

    /// Namespace levels followed by the name.
    pub fn levels(&self) -> Vec<&str> {
        self.namespace
            .levels()
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.name.as_str()))
            .collect()
    }

    /// Identifier of the catalog an object below a catalog belongs to.
    pub fn catalog_identifier(&self) -> Option<NameIdentifier> {
        let levels = self.levels();
        if levels.len() < 2 {
            return None;
        }
        Some(NameIdentifier::of_catalog(levels[0], levels[1]))
    }
}

impl fmt::Display for NameIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

/// Correlation key linking a metadata store record to the external object it describes.
/// Embedded into the external object's properties at creation time and never shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringIdentifier {
    id: EntityId,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid string identifier {value:?}")]
pub struct StringIdentifierParseError {
    pub value: String,
}

impl StringIdentifier {
    pub fn from_id(id: EntityId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn parse(value: &str) -> Result<Self, StringIdentifierParseError> {
        value
            .strip_prefix(STRING_ID_PREFIX)
            .and_then(|id| id.parse::<EntityId>().ok())
            .map(Self::from_id)
            .ok_or_else(|| StringIdentifierParseError {
                value: value.to_string(),
            })
    }

    /// Extracts the embedded identifier. `Ok(None)` means the object carries none.
    pub fn from_properties(
        properties: &HashMap<String, String>,
    ) -> Result<Option<Self>, StringIdentifierParseError> {
        properties.get(ID_KEY).map(|v| Self::parse(v)).transpose()
    }

    /// Copy of `properties` with this identifier embedded.
    pub fn with_properties(
        &self,
        properties: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut updated = properties.clone();
        updated.insert(ID_KEY.to_string(), self.to_string());
        updated
    }
}

impl fmt::Display for StringIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STRING_ID_PREFIX}{}", self.id)
    }
}
