//! Registration CRD types
//!
//! A registration declares a new API resource type at runtime. Its object
//! name is derived from the spec (`pluralName.group`) and is the only
//! identifier protected by plain object-name uniqueness. Every other name it
//! claims is policed by the control plane's conflict reconciler.

use crate::{
    ConditionType, Conditions, CrdError, ObjectMeta, RegistrationStatus, Result, TypeMeta,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Registration resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Type metadata (apiVersion, kind)
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Registration specification
    pub spec: RegistrationSpec,

    /// Status (server-managed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RegistrationStatus>,
}

impl Registration {
    /// Create a namespaced registration with a derived object name
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        plural_name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        let spec = RegistrationSpec {
            group: group.into(),
            version: version.into(),
            plural_name: plural_name.into(),
            singular_name: None,
            short_names: Vec::new(),
            kind: kind.into(),
            list_kind: None,
            cluster_scoped: false,
        };
        Self {
            type_meta: TypeMeta::registration(),
            metadata: ObjectMeta::new(spec.derived_name()),
            spec,
            status: None,
        }
    }

    pub fn with_singular(mut self, singular: impl Into<String>) -> Self {
        self.spec.singular_name = Some(singular.into());
        self
    }

    pub fn with_short_name(mut self, short_name: impl Into<String>) -> Self {
        self.spec.short_names.push(short_name.into());
        self
    }

    pub fn with_list_kind(mut self, list_kind: impl Into<String>) -> Self {
        self.spec.list_kind = Some(list_kind.into());
        self
    }

    pub fn with_cluster_scope(mut self) -> Self {
        self.spec.cluster_scoped = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Conditions, empty if no status has been written yet
    pub fn conditions(&self) -> Conditions {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }

    /// `NameConflict=False`: the reconciler granted every claimed identifier
    pub fn is_accepted(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_false(ConditionType::NameConflict))
            .unwrap_or(false)
    }

    /// `Terminating=True`: deletion is in progress
    pub fn is_terminating(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.is_true(ConditionType::Terminating))
            .unwrap_or(false)
    }

    /// Validate the registration
    pub fn validate(&self) -> Result<()> {
        self.spec.validate()?;

        let expected = self.spec.derived_name();
        if self.metadata.name.is_empty() {
            return Err(CrdError::MissingField("metadata.name".to_string()));
        }
        if self.metadata.name != expected {
            return Err(CrdError::NameMismatch {
                expected,
                actual: self.metadata.name.clone(),
            });
        }
        if self.metadata.namespace.is_some() {
            return Err(CrdError::InvalidFieldValue {
                field: "metadata.namespace".to_string(),
                message: "registrations are cluster-scoped".to_string(),
            });
        }

        Ok(())
    }

    /// Validate a registration submitted for creation
    pub fn validate_create(&self) -> Result<()> {
        self.validate()?;
        if self.status.as_ref().is_some_and(|s| !s.is_empty()) {
            return Err(CrdError::ServerManagedField("status".to_string()));
        }
        Ok(())
    }
}

/// Registration specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    /// API group the new type is served under
    pub group: String,

    /// The single served version
    pub version: String,

    /// URL path segment, e.g. "widgets"
    pub plural_name: String,

    /// Defaults to the lowercased kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,

    /// Serialized kind of instances, e.g. "Widget"
    pub kind: String,

    /// Defaults to `kind + "List"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_kind: Option<String>,

    pub cluster_scoped: bool,
}

impl RegistrationSpec {
    /// The object name a registration with this spec must carry
    pub fn derived_name(&self) -> String {
        format!("{}.{}", self.plural_name, self.group)
    }

    pub fn singular(&self) -> String {
        self.singular_name
            .clone()
            .unwrap_or_else(|| self.kind.to_lowercase())
    }

    pub fn list_kind(&self) -> String {
        self.list_kind
            .clone()
            .unwrap_or_else(|| format!("{}List", self.kind))
    }

    /// Every identifier this spec claims, with defaults applied
    pub fn claimed_identifiers(&self) -> Vec<(IdentifierKind, String)> {
        let mut ids = vec![
            (IdentifierKind::PluralName, self.plural_name.clone()),
            (IdentifierKind::SingularName, self.singular()),
        ];
        ids.extend(
            self.short_names
                .iter()
                .map(|s| (IdentifierKind::ShortName, s.clone())),
        );
        ids.push((IdentifierKind::Kind, self.kind.clone()));
        ids.push((IdentifierKind::ListKind, self.list_kind()));
        ids
    }

    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(CrdError::MissingField("spec.group".to_string()));
        }
        if !is_dns_subdomain(&self.group) {
            return Err(invalid("spec.group", "must be a lowercase DNS subdomain"));
        }

        if self.version.is_empty() {
            return Err(CrdError::MissingField("spec.version".to_string()));
        }
        if !is_dns_label(&self.version) {
            return Err(invalid("spec.version", "must be a lowercase DNS label"));
        }

        if self.plural_name.is_empty() {
            return Err(CrdError::MissingField("spec.pluralName".to_string()));
        }
        if !is_dns_label(&self.plural_name) {
            return Err(invalid("spec.pluralName", "must be a lowercase DNS label"));
        }

        if let Some(singular) = &self.singular_name {
            if !is_dns_label(singular) {
                return Err(invalid("spec.singularName", "must be a lowercase DNS label"));
            }
        }

        let mut seen = HashSet::new();
        for (i, short) in self.short_names.iter().enumerate() {
            if !is_dns_label(short) {
                return Err(invalid(
                    &format!("spec.shortNames[{}]", i),
                    "must be a lowercase DNS label",
                ));
            }
            if !seen.insert(short.as_str()) {
                return Err(invalid(
                    &format!("spec.shortNames[{}]", i),
                    &format!("duplicate short name '{}'", short),
                ));
            }
        }

        if self.kind.is_empty() {
            return Err(CrdError::MissingField("spec.kind".to_string()));
        }
        if !is_kind(&self.kind) {
            return Err(invalid("spec.kind", "must start with a letter and be alphanumeric"));
        }

        if let Some(list_kind) = &self.list_kind {
            if !is_kind(list_kind) {
                return Err(invalid(
                    "spec.listKind",
                    "must start with a letter and be alphanumeric",
                ));
            }
        }
        if self.list_kind() == self.kind {
            return Err(invalid("spec.listKind", "must differ from spec.kind"));
        }

        Ok(())
    }
}

/// The identifier classes a registration claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentifierKind {
    PluralName,
    SingularName,
    ShortName,
    Kind,
    ListKind,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PluralName => write!(f, "plural name"),
            Self::SingularName => write!(f, "singular name"),
            Self::ShortName => write!(f, "short name"),
            Self::Kind => write!(f, "kind"),
            Self::ListKind => write!(f, "list kind"),
        }
    }
}

fn invalid(field: &str, message: &str) -> CrdError {
    CrdError::InvalidFieldValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

fn is_dns_subdomain(value: &str) -> bool {
    value.len() <= 253 && value.split('.').all(is_dns_label)
}

fn is_kind(value: &str) -> bool {
    value.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && value.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConditionStatus;
    use chrono::Utc;

    fn widgets() -> Registration {
        Registration::new("example.com", "v1", "widgets", "Widget")
    }

    #[test]
    fn test_registration_new_derives_name() {
        let reg = widgets();
        assert_eq!(reg.name(), "widgets.example.com");
        assert_eq!(reg.type_meta.kind, "Registration");
        assert_eq!(reg.type_meta.api_version, "registrar.io/v1");
        assert!(!reg.spec.cluster_scoped);
    }

    #[test]
    fn test_defaults_for_singular_and_list_kind() {
        let reg = widgets();
        assert_eq!(reg.spec.singular(), "widget");
        assert_eq!(reg.spec.list_kind(), "WidgetList");

        let reg = widgets().with_singular("wdgt").with_list_kind("Widgets");
        assert_eq!(reg.spec.singular(), "wdgt");
        assert_eq!(reg.spec.list_kind(), "Widgets");
    }

    #[test]
    fn test_claimed_identifiers() {
        let reg = widgets().with_short_name("wd").with_short_name("wg");
        let ids = reg.spec.claimed_identifiers();
        assert_eq!(
            ids,
            vec![
                (IdentifierKind::PluralName, "widgets".to_string()),
                (IdentifierKind::SingularName, "widget".to_string()),
                (IdentifierKind::ShortName, "wd".to_string()),
                (IdentifierKind::ShortName, "wg".to_string()),
                (IdentifierKind::Kind, "Widget".to_string()),
                (IdentifierKind::ListKind, "WidgetList".to_string()),
            ]
        );
    }

    #[test]
    fn test_validate_ok() {
        assert!(widgets().validate().is_ok());
        assert!(widgets().with_cluster_scope().validate_create().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_name() {
        let mut reg = widgets();
        reg.metadata.name = "gadgets.example.com".to_string();
        match reg.validate() {
            Err(CrdError::NameMismatch { expected, actual }) => {
                assert_eq!(expected, "widgets.example.com");
                assert_eq!(actual, "gadgets.example.com");
            }
            other => panic!("expected NameMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let reg = Registration::new("example.com", "v1", "", "Widget");
        assert!(matches!(reg.validate(), Err(CrdError::MissingField(f)) if f == "spec.pluralName"));

        let reg = Registration::new("example.com", "v1", "widgets", "");
        assert!(matches!(reg.validate(), Err(CrdError::MissingField(f)) if f == "spec.kind"));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let reg = Registration::new("Example.com", "v1", "widgets", "Widget");
        assert!(reg.validate().is_err());

        let reg = Registration::new("example.com", "v1", "Widgets", "Widget");
        assert!(reg.validate().is_err());

        let reg = widgets().with_short_name("wd").with_short_name("wd");
        assert!(reg.validate().is_err());

        let reg = widgets().with_list_kind("Widget");
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_validate_create_rejects_client_status() {
        let mut reg = widgets();
        let mut status = RegistrationStatus::default();
        status.conditions.set(
            ConditionType::NameConflict,
            ConditionStatus::False,
            "NoConflicts",
            "",
            Utc::now(),
        );
        reg.status = Some(status);

        assert!(matches!(
            reg.validate_create(),
            Err(CrdError::ServerManagedField(f)) if f == "status"
        ));

        // An empty status block is harmless.
        reg.status = Some(RegistrationStatus::default());
        assert!(reg.validate_create().is_ok());
    }

    #[test]
    fn test_acceptance_and_termination_flags() {
        let mut reg = widgets();
        assert!(!reg.is_accepted());
        assert!(!reg.is_terminating());

        let mut status = RegistrationStatus::default();
        let now = Utc::now();
        status.conditions.set(ConditionType::NameConflict, ConditionStatus::False, "NoConflicts", "", now);
        status.conditions.set(ConditionType::Terminating, ConditionStatus::True, "Deleting", "", now);
        reg.status = Some(status);

        assert!(reg.is_accepted());
        assert!(reg.is_terminating());
    }

    #[test]
    fn test_registration_serialization() {
        let reg = widgets().with_short_name("wd");
        let json = serde_json::to_value(&reg).unwrap();

        assert_eq!(json["apiVersion"], "registrar.io/v1");
        assert_eq!(json["kind"], "Registration");
        assert_eq!(json["metadata"]["name"], "widgets.example.com");
        assert_eq!(json["spec"]["pluralName"], "widgets");
        assert_eq!(json["spec"]["clusterScoped"], false);
        assert!(json.get("status").is_none());

        let parsed: Registration = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, reg);
    }

    #[test]
    fn test_cluster_scoped_is_required_on_the_wire() {
        let json = serde_json::json!({
            "apiVersion": "registrar.io/v1",
            "kind": "Registration",
            "metadata": {"name": "widgets.example.com"},
            "spec": {"group": "example.com", "version": "v1", "pluralName": "widgets", "kind": "Widget"}
        });
        assert!(serde_json::from_value::<Registration>(json).is_err());
    }
}
