//! Subject profile attached to an enrolled reference image.
//!
//! Stored as `<data_dir>/<base>.json`. Known keys are typed; anything else
//! is kept in `extra` and written back unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, rename = "additionalInfo", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SubjectProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Profile name, or `fallback` (usually the gallery base name) when unset.
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(fallback)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Populated fields in display order, extra keys last (sorted).
    pub fn fields(&self) -> Vec<(String, String)> {
        let typed = [
            ("name", &self.name),
            ("id", &self.id),
            ("department", &self.department),
            ("email", &self.email),
            ("phone", &self.phone),
            ("additionalInfo", &self.notes),
            ("createdAt", &self.created_at),
            ("fileName", &self.file_name),
        ];
        let mut out: Vec<(String, String)> = typed
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect();
        for (k, v) in &self.extra {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push((k.clone(), v));
        }
        out
    }
}
