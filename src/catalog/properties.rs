use std::collections::{BTreeMap, HashMap, HashSet};

use crate::catalog::ObjectChange;
use crate::error::{Error, Result};
use crate::identifier::ID_KEY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEntry {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub immutable: bool,
    /// Never returned to callers.
    pub hidden: bool,
    /// Set by the system only.
    pub reserved: bool,
}

impl PropertyEntry {
    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
            immutable: false,
            hidden: false,
            reserved: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn reserved(mut self) -> Self {
        self.reserved = true;
        self
    }
}

/// Properties a connector declares for one kind of object. Keys it doesn't declare
/// are passed through unchecked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySchema {
    entries: BTreeMap<String, PropertyEntry>,
}

impl Default for PropertySchema {
    fn default() -> Self {
        Self::new(vec![])
    }
}

impl PropertySchema {
    /// The correlation key is always part of the schema, hidden and reserved.
    pub fn new(entries: Vec<PropertyEntry>) -> Self {
        let mut all: BTreeMap<String, PropertyEntry> = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        all.insert(
            ID_KEY.to_string(),
            PropertyEntry::optional(ID_KEY, "Correlation key of the metadata store record")
                .immutable()
                .hidden()
                .reserved(),
        );
        Self { entries: all }
    }

    pub fn entry(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.get(name)
    }

    pub fn hidden_keys(&self) -> HashSet<&str> {
        self.entries
            .values()
            .filter(|e| e.hidden)
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn validate_for_create(&self, properties: &HashMap<String, String>) -> Result<()> {
        for key in properties.keys() {
            if self.entry(key).is_some_and(|e| e.reserved) {
                return Err(Error::invalid_argument(format!(
                    "Property {key:?} is reserved and cannot be set"
                )));
            }
        }

        let mut missing: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.required && !properties.contains_key(&e.name))
            .map(|e| e.name.as_str())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(Error::invalid_argument(format!(
                "Missing required properties: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub fn validate_for_alter(&self, changes: &[ObjectChange]) -> Result<()> {
        for change in changes {
            let Some(key) = change.property_key() else {
                continue;
            };
            let Some(entry) = self.entry(key) else {
                continue;
            };
            if entry.reserved {
                return Err(Error::invalid_argument(format!(
                    "Property {key:?} is reserved and cannot be altered"
                )));
            }
            if entry.immutable {
                return Err(Error::invalid_argument(format!(
                    "Property {key:?} is immutable"
                )));
            }
            if entry.required && matches!(change, ObjectChange::RemoveProperty(_)) {
                return Err(Error::invalid_argument(format!(
                    "Property {key:?} is required and cannot be removed"
                )));
            }
        }
        Ok(())
    }

    /// Copy of `properties` without the keys callers must not see.
    pub fn strip_hidden(&self, properties: &HashMap<String, String>) -> HashMap<String, String> {
        let hidden = self.hidden_keys();
        properties
            .iter()
            .filter(|(k, _)| !hidden.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn schema() -> PropertySchema {
        PropertySchema::new(vec![
            PropertyEntry::optional("location", "Storage location")
                .required()
                .immutable(),
            PropertyEntry::optional("secret", "Access token").hidden(),
            PropertyEntry::optional("owner", "Owning team"),
        ])
    }

    #[test]
    fn test_validate_for_create() {
        let schema = schema();
        schema
            .validate_for_create(&HashMap::from([(
                "location".to_string(),
                "s3://bucket".to_string(),
            )]))
            .unwrap();

        let err = schema.validate_for_create(&HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = schema
            .validate_for_create(&HashMap::from([
                ("location".to_string(), "s3://bucket".to_string()),
                (ID_KEY.to_string(), "lakeward-1".to_string()),
            ]))
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_validate_for_alter() {
        let schema = schema();
        schema
            .validate_for_alter(&[
                ObjectChange::SetProperty {
                    key: "owner".to_string(),
                    value: "data".to_string(),
                },
                ObjectChange::UpdateComment("new".to_string()),
            ])
            .unwrap();

        assert!(schema
            .validate_for_alter(&[ObjectChange::SetProperty {
                key: "location".to_string(),
                value: "s3://other".to_string(),
            }])
            .unwrap_err()
            .to_string()
            .contains("immutable"));
        assert!(schema
            .validate_for_alter(&[ObjectChange::RemoveProperty(ID_KEY.to_string())])
            .is_err());
    }

    #[test]
    fn test_strip_hidden() {
        let stripped = schema().strip_hidden(&HashMap::from([
            ("secret".to_string(), "hunter2".to_string()),
            ("owner".to_string(), "data".to_string()),
            (ID_KEY.to_string(), "lakeward-1".to_string()),
        ]));
        assert_eq!(
            stripped,
            HashMap::from([("owner".to_string(), "data".to_string())])
        );
    }
}
