//! Structured validation and dependency errors returned by the API, and
//! the warning payloads carried in response headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Response header carrying JSON-encoded [`Warning`] values. The header
/// may repeat.
pub const WARNING_HEADER: &str = "warning";

/// Field path used to reference the root object in a field error.
pub const FIELD_ROOT: &str = "(root)";

/// The type of validation constraint which has been broken. The codes
/// match the validator names from JSON Schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The supplied value is deprecated.
    #[serde(rename = "deprecated")]
    Deprecated,
    /// The supplied value is shorter than the allowed minimum.
    #[serde(rename = "minLength")]
    MinLength,
    /// The supplied value is longer than the allowed maximum.
    #[serde(rename = "maxLength")]
    MaxLength,
    /// A required field was not specified.
    #[serde(rename = "required")]
    Required,
    /// The input doesn't match the required regex pattern.
    #[serde(rename = "pattern")]
    Pattern,
    /// The named reference must exist.
    #[serde(rename = "mustExist")]
    MustExist,
    /// The named reference should exist.
    #[serde(rename = "shouldExist")]
    ShouldExist,
    /// The given value cannot be changed from a pre-defined value.
    #[serde(rename = "readOnly")]
    ReadOnly,
    /// A different type was expected.
    #[serde(rename = "invalidType")]
    InvalidType,
    /// The given value is invalid.
    #[serde(rename = "invalidValue")]
    InvalidValue,
    /// The given value is not allowed.
    #[serde(rename = "notAllowed")]
    NotAllowed,
    /// The given value is not unique.
    #[serde(rename = "mustBeUnique")]
    MustBeUnique,
    /// The field cannot be changed after creation.
    #[serde(rename = "immutable")]
    Immutable,
    /// The field error is a warning rather than a hard failure.
    #[serde(rename = "fieldWarning")]
    FieldWarning,
    /// The given value is not currently supported, but will be.
    #[serde(rename = "notYetImplemented")]
    NotYetImplemented,
    /// Any code this client does not recognise.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Returns true for codes which represent warnings rather than
    /// errors.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ErrorCode::Deprecated | ErrorCode::ShouldExist | ErrorCode::FieldWarning
        )
    }
}

/// A validation error on a specific field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field causing the error, in format x.y.z.
    pub field: String,
    /// The type of constraint which has been broken.
    #[serde(rename = "errCode")]
    pub err_code: ErrorCode,
    /// Human-readable description of the validation error.
    pub message: String,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(field: impl Into<String>, err_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            err_code,
            message: message.into(),
        }
    }
}

/// Error returned when input provided by the user has failed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Machine-readable code, normally 400.
    #[serde(default)]
    pub code: u16,
    /// Human-readable message related to the error.
    #[serde(default)]
    pub message: String,
    /// Individual validation errors found against the submitted data.
    #[serde(rename = "fieldErrors", default)]
    pub field_errors: Vec<FieldError>,
}

impl ValidationError {
    /// Creates a validation error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            message: message.into(),
            field_errors: Vec::new(),
        }
    }

    /// Adds a field error, skipping exact duplicates.
    pub fn with_field_error(
        mut self,
        field: impl Into<String>,
        err_code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let fe = FieldError::new(field, err_code, message);
        if !self.field_errors.contains(&fe) {
            self.field_errors.push(fe);
        }
        self
    }

    /// Returns true if any field errors have been recorded.
    pub fn has_errors(&self) -> bool {
        !self.field_errors.is_empty()
    }

    /// Returns the field errors which are warnings.
    pub fn warnings(&self) -> Vec<&FieldError> {
        self.field_errors
            .iter()
            .filter(|fe| fe.err_code.is_warning())
            .collect()
    }

    /// Returns the field errors which are NOT warnings.
    pub fn non_warnings(&self) -> Vec<&FieldError> {
        self.field_errors
            .iter()
            .filter(|fe| !fe.err_code.is_warning())
            .collect()
    }

    /// Checks if an error with a matching field exists.
    pub fn contains_field(&self, field: &str) -> bool {
        self.field_errors.iter().any(|fe| fe.field == field)
    }
}

impl fmt::Display for ValidationError {
    // Renders nothing when there are no field errors; the response
    // classifier then falls back to its per-status message table.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field_errors.is_empty() {
            return Ok(());
        }
        writeln!(f, "{}:", self.message)?;
        for fe in &self.field_errors {
            if fe.field == FIELD_ROOT {
                writeln!(f, " * {}", fe.message)?;
            } else {
                writeln!(f, " * {}: {}", fe.field, fe.message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// An object reference to a dependent object blocking an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentReference {
    /// Kind of the dependent.
    pub kind: String,
    /// Name of the dependent.
    pub name: String,
    /// Version of the resource, if it is a versioned resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Workspace of the dependent, empty for workspace-less resources.
    #[serde(default)]
    pub workspace: String,
    /// True if this is a system resource.
    #[serde(default)]
    pub system: bool,
}

impl fmt::Display for DependentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.workspace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)?;
        } else {
            write!(f, "{}/{}/{}", self.kind, self.workspace, self.name)?;
        }
        if let Some(version) = &self.version {
            write!(f, "@{}", version)?;
        }
        Ok(())
    }
}

impl FromStr for DependentReference {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (path, version) = match input.rsplit_once('@') {
            Some((path, version)) => (path, Some(version.to_string())),
            None => (input, None),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let mut d = DependentReference {
            version,
            ..Default::default()
        };
        match parts.as_slice() {
            [kind, workspace, name] => {
                d.kind = kind.to_string();
                d.workspace = workspace.to_string();
                d.name = name.to_string();
            }
            [kind, name] => {
                d.kind = kind.to_string();
                d.name = name.to_string();
            }
            _ => return Err(format!("incorrect dependent reference format: {}", input)),
        }

        Ok(d)
    }
}

/// Error returned when dependent objects block a delete or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyViolation {
    /// Human-readable message related to the error.
    #[serde(default)]
    pub message: String,
    /// The objects blocking the operation.
    #[serde(default)]
    pub dependents: Vec<DependentReference>,
}

impl fmt::Display for DependencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let user_owned: Vec<String> = self
            .dependents
            .iter()
            .filter(|d| !d.system)
            .map(|d| format!(" * {}\n", d))
            .collect();

        if !user_owned.is_empty() {
            let message = if self.message.is_empty() {
                "the following objects need to be deleted first"
            } else {
                self.message.trim_end_matches(':')
            };
            write!(f, "{}:\n{}", message, user_owned.concat())
        } else {
            let all: String = self
                .dependents
                .iter()
                .map(|d| format!(" * {}\n", d))
                .collect();
            write!(
                f,
                "waiting for the following objects to be deleted by Wayfinder:\n{}",
                all
            )
        }
    }
}

impl std::error::Error for DependencyViolation {}

/// The category of a response warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningType {
    /// A referenced dependency does not exist.
    Dependency,
    /// A free-form warning message.
    General,
    /// A deprecated field was used.
    FieldDeprecated,
}

/// A warning carried in a response header, parsed independently of the
/// main success or error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Discriminates the shape of the warning.
    #[serde(rename = "warningType")]
    pub warning_type: WarningType,
    /// API version of the resource, for deprecation warnings.
    #[serde(rename = "apiVersion", default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Kind of the subject resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Name of the subject resource or field.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Version of the subject resource, if versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Workspace of the subject resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    /// Free-form message, for general warnings.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Warning {
    fn is_actionable(&self) -> bool {
        (!self.name.is_empty() && !self.kind.is_empty()) || !self.message.is_empty()
    }

    /// Renders the warning for display, or `None` for warnings which
    /// carry nothing worth surfacing.
    pub fn display_message(&self) -> Option<String> {
        if !self.is_actionable() {
            return None;
        }

        match self.warning_type {
            WarningType::Dependency => {
                let name = match &self.version {
                    Some(version) => format!("{} (version {})", self.name, version),
                    None => self.name.clone(),
                };
                if self.workspace.is_empty() {
                    Some(format!("Dependency {} {} does not exist", self.kind, name))
                } else {
                    Some(format!(
                        "Dependency {} {} {} does not exist",
                        self.kind, self.workspace, name
                    ))
                }
            }
            WarningType::FieldDeprecated => {
                let version_kind = if self.api_version.is_empty() {
                    self.kind.clone()
                } else {
                    format!("{}/{}", self.api_version, self.kind)
                };
                Some(format!(
                    "Field {} on {} is deprecated and will be removed in a later version",
                    self.name, version_kind
                ))
            }
            WarningType::General => Some(format!("* {}: {}", self.name, self.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("invalid")
            .with_field_error("spec.name", ErrorCode::Required, "is required")
            .with_field_error(FIELD_ROOT, ErrorCode::InvalidValue, "no good at all");

        let rendered = err.to_string();
        assert!(rendered.contains("invalid:"));
        assert!(rendered.contains(" * spec.name: is required"));
        assert!(rendered.contains(" * no good at all"));
    }

    #[test]
    fn test_validation_error_display_empty() {
        let err = ValidationError::new("invalid");
        assert_eq!(err.to_string(), "");
    }

    #[test]
    fn test_validation_error_dedupe() {
        let err = ValidationError::new("invalid")
            .with_field_error("a", ErrorCode::Required, "is required")
            .with_field_error("a", ErrorCode::Required, "is required");
        assert_eq!(err.field_errors.len(), 1);
    }

    #[test]
    fn test_validation_error_decodes() {
        let body = r#"{"message":"invalid","fieldErrors":[{"field":"spec.name","errCode":"required","message":"is required"}]}"#;
        let err: ValidationError = serde_json::from_str(body).unwrap();
        assert_eq!(err.field_errors[0].err_code, ErrorCode::Required);
        assert!(err.to_string().contains("spec.name: is required"));
    }

    #[test]
    fn test_unknown_error_code_tolerated() {
        let body = r#"{"field":"x","errCode":"somethingNew","message":"m"}"#;
        let fe: FieldError = serde_json::from_str(body).unwrap();
        assert_eq!(fe.err_code, ErrorCode::Unknown);
    }

    #[test]
    fn test_dependent_reference_round_trip() {
        for input in [
            "Cluster/prod",
            "AppEnv/teamA/prod",
            "AppEnv/teamA/prod@v1",
        ] {
            let d: DependentReference = input.parse().unwrap();
            assert_eq!(d.to_string(), input);
        }

        assert!("garbage".parse::<DependentReference>().is_err());
    }

    #[test]
    fn test_dependency_violation_display() {
        let violation = DependencyViolation {
            message: String::new(),
            dependents: vec![
                DependentReference {
                    kind: "Cluster".to_string(),
                    name: "prod".to_string(),
                    workspace: "teamA".to_string(),
                    ..Default::default()
                },
                DependentReference {
                    kind: "DNSZone".to_string(),
                    name: "internal".to_string(),
                    system: true,
                    ..Default::default()
                },
            ],
        };

        let rendered = violation.to_string();
        assert!(rendered.starts_with("the following objects need to be deleted first:"));
        assert!(rendered.contains(" * Cluster/teamA/prod"));
        // system dependents are not shown when user-owned blockers exist
        assert!(!rendered.contains("DNSZone"));
    }

    #[test]
    fn test_dependency_violation_system_only() {
        let violation = DependencyViolation {
            message: String::new(),
            dependents: vec![DependentReference {
                kind: "DNSZone".to_string(),
                name: "internal".to_string(),
                system: true,
                ..Default::default()
            }],
        };

        let rendered = violation.to_string();
        assert!(rendered.starts_with("waiting for the following objects to be deleted by Wayfinder:"));
        assert!(rendered.contains(" * DNSZone/internal"));
    }

    #[test]
    fn test_warning_display() {
        let warning = Warning {
            warning_type: WarningType::Dependency,
            api_version: String::new(),
            kind: "Cluster".to_string(),
            name: "prod".to_string(),
            version: None,
            workspace: "teamA".to_string(),
            message: String::new(),
        };
        assert_eq!(
            warning.display_message().unwrap(),
            "Dependency Cluster teamA prod does not exist"
        );

        let deprecated = Warning {
            warning_type: WarningType::FieldDeprecated,
            api_version: "v2beta1".to_string(),
            kind: "AppEnv".to_string(),
            name: "spec.legacy".to_string(),
            version: None,
            workspace: String::new(),
            message: String::new(),
        };
        assert_eq!(
            deprecated.display_message().unwrap(),
            "Field spec.legacy on v2beta1/AppEnv is deprecated and will be removed in a later version"
        );
    }

    #[test]
    fn test_warning_unactionable() {
        let warning = Warning {
            warning_type: WarningType::General,
            api_version: String::new(),
            kind: String::new(),
            name: String::new(),
            version: None,
            workspace: String::new(),
            message: String::new(),
        };
        assert!(warning.display_message().is_none());
    }
}
