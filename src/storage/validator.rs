//! Container invariant validator
//!
//! Runs against the container read back from disk after every write. A save
//! is only considered durable when every rule passes. Uses the Chain of
//! Responsibility pattern for validation rules.

use super::config::StoreConfig;
use crate::core::{Container, IntegrityError, Record};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;

/// Facts about the write that rules need besides the container itself
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    pub serialized_len: u64,
    pub today: NaiveDate,
}

impl ValidationContext {
    pub fn new(serialized_len: u64) -> Self {
        Self {
            serialized_len,
            today: Utc::now().date_naive(),
        }
    }
}

/// Trait for validation rules (Chain of Responsibility pattern)
pub trait ValidationRule<R: Record>: Send + Sync {
    fn validate(
        &self,
        container: &Container<R>,
        ctx: &ValidationContext,
    ) -> Result<(), IntegrityError>;
}

/// Record ids must be unique within the container
#[derive(Debug, Clone, Default)]
pub struct UniqueIdsRule;

impl<R: Record> ValidationRule<R> for UniqueIdsRule {
    fn validate(
        &self,
        container: &Container<R>,
        _ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        let mut seen = HashSet::with_capacity(container.records.len());
        let mut duplicates = Vec::new();
        for record in &container.records {
            let id = record.id();
            if !seen.insert(id) && !duplicates.contains(&id) {
                duplicates.push(id);
            }
        }
        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(IntegrityError::DuplicateIds(duplicates))
        }
    }
}

/// Schema version must be present
#[derive(Debug, Clone, Default)]
pub struct SchemaVersionRule;

impl<R: Record> ValidationRule<R> for SchemaVersionRule {
    fn validate(
        &self,
        container: &Container<R>,
        _ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        if container.schema_version.trim().is_empty() {
            return Err(IntegrityError::InvalidVersion(container.schema_version.clone()));
        }
        Ok(())
    }
}

/// Serialized payload must stay under the configured ceiling
#[derive(Debug, Clone)]
pub struct PayloadSizeRule {
    pub limit: u64,
}

impl<R: Record> ValidationRule<R> for PayloadSizeRule {
    fn validate(
        &self,
        _container: &Container<R>,
        ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        if ctx.serialized_len > self.limit {
            return Err(IntegrityError::OversizePayload {
                size: ctx.serialized_len,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Text must not carry NUL bytes or replacement characters left by a lossy
/// decode
#[derive(Debug, Clone, Default)]
pub struct TextEncodingRule;

pub fn is_clean_text(text: &str) -> bool {
    !text
        .chars()
        .any(|c| c == '\0' || c == char::REPLACEMENT_CHARACTER)
}

impl<R: Record> ValidationRule<R> for TextEncodingRule {
    fn validate(
        &self,
        container: &Container<R>,
        _ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        if !is_clean_text(&container.schema_version) {
            return Err(IntegrityError::InvalidVersion(container.schema_version.clone()));
        }
        for record in &container.records {
            for (field, value) in record.text_fields() {
                if !is_clean_text(value) {
                    return Err(IntegrityError::InvalidEncoding {
                        record_id: record.id(),
                        field: field.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Start must not come after end, and must not lie in the future unless
/// allowed
#[derive(Debug, Clone, Default)]
pub struct DateOrderingRule {
    pub allow_future_start: bool,
}

impl<R: Record> ValidationRule<R> for DateOrderingRule {
    fn validate(
        &self,
        container: &Container<R>,
        ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        for record in &container.records {
            for span in record.date_spans() {
                if let Some(end) = span.end {
                    if span.start > end {
                        return Err(IntegrityError::InvalidDateOrdering {
                            record_id: record.id(),
                            detail: format!("{}: start {} is after end {}", span.field, span.start, end),
                        });
                    }
                }
                if !self.allow_future_start && span.start > ctx.today {
                    return Err(IntegrityError::InvalidDateOrdering {
                        record_id: record.id(),
                        detail: format!("{}: start {} is in the future", span.field, span.start),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Every record's own domain rules
#[derive(Debug, Clone, Default)]
pub struct DomainRule;

impl<R: Record> ValidationRule<R> for DomainRule {
    fn validate(
        &self,
        container: &Container<R>,
        _ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        for record in &container.records {
            record
                .check_domain_rules()
                .map_err(|detail| IntegrityError::DomainViolation {
                    record_id: record.id(),
                    detail,
                })?;
        }
        Ok(())
    }
}

/// Main container validator using Chain of Responsibility
pub struct ContainerValidator<R: Record> {
    rules: Vec<Box<dyn ValidationRule<R>>>,
}

impl<R: Record> ContainerValidator<R> {
    /// Create validator with the rules a store config asks for
    pub fn from_config(config: &StoreConfig) -> Self {
        let mut rules: Vec<Box<dyn ValidationRule<R>>> = vec![
            Box::new(SchemaVersionRule),
            Box::new(PayloadSizeRule {
                limit: config.max_payload_bytes,
            }),
            Box::new(UniqueIdsRule),
            Box::new(TextEncodingRule),
            Box::new(DateOrderingRule {
                allow_future_start: config.allow_future_start,
            }),
        ];
        if config.strict_domain_validation {
            rules.push(Box::new(DomainRule));
        }
        Self { rules }
    }

    /// Create validator with custom rules
    pub fn with_rules(rules: Vec<Box<dyn ValidationRule<R>>>) -> Self {
        Self { rules }
    }

    /// Validate a container against all rules
    pub fn validate(
        &self,
        container: &Container<R>,
        ctx: &ValidationContext,
    ) -> Result<(), IntegrityError> {
        for rule in &self.rules {
            rule.validate(container, ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Goal;
    use chrono::Duration;

    fn validator() -> ContainerValidator<Goal> {
        ContainerValidator::from_config(&StoreConfig::default())
    }

    fn ctx() -> ValidationContext {
        ValidationContext::new(1_000)
    }

    #[test]
    fn test_valid_container_passes() {
        let container = Container::empty("1.0.0").with_records(vec![
            Goal::decreasing("a", 5.0, 2.0),
            Goal::increasing("b", 1.0, 3.0),
        ]);
        assert!(validator().validate(&container, &ctx()).is_ok());
    }

    #[test]
    fn test_duplicate_ids_reported_once() {
        let goal = Goal::decreasing("a", 5.0, 2.0);
        let container = Container::empty("1.0.0").with_records(vec![
            goal.clone(),
            goal.clone().with_notes("copy"),
            goal.clone(),
        ]);
        let err = validator().validate(&container, &ctx()).unwrap_err();
        assert_eq!(err, IntegrityError::DuplicateIds(vec![goal.id]));
    }

    #[test]
    fn test_blank_version_rejected() {
        let container = Container::<Goal>::empty("  ");
        assert!(matches!(
            validator().validate(&container, &ctx()),
            Err(IntegrityError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let container = Container::<Goal>::empty("1.0.0");
        let big = ValidationContext::new(StoreConfig::default().max_payload_bytes + 1);
        assert!(matches!(
            validator().validate(&container, &big),
            Err(IntegrityError::OversizePayload { .. })
        ));
    }

    #[test]
    fn test_replacement_character_rejected() {
        let goal = Goal::decreasing("bad \u{FFFD} text", 5.0, 2.0);
        let container = Container::empty("1.0.0").with_records(vec![goal]);
        assert!(matches!(
            validator().validate(&container, &ctx()),
            Err(IntegrityError::InvalidEncoding { field, .. }) if field == "title"
        ));
    }

    #[test]
    fn test_date_ordering() {
        let today = Utc::now().date_naive();
        let inverted = Goal::increasing("x", 1.0, 2.0)
            .with_dates(today - Duration::days(1), Some(today - Duration::days(3)));
        let container = Container::empty("1.0.0").with_records(vec![inverted]);
        assert!(matches!(
            validator().validate(&container, &ctx()),
            Err(IntegrityError::InvalidDateOrdering { .. })
        ));

        let future = Goal::increasing("y", 1.0, 2.0).with_dates(today + Duration::days(10), None);
        let container = Container::empty("1.0.0").with_records(vec![future]);
        assert!(validator().validate(&container, &ctx()).is_err());

        let permissive =
            ContainerValidator::from_config(&StoreConfig::new().allow_future_start(true));
        assert!(permissive.validate(&container, &ctx()).is_ok());
    }

    #[test]
    fn test_domain_rules_only_when_strict() {
        let container =
            Container::empty("1.0.0").with_records(vec![Goal::decreasing("bad", 5.0, 6.0)]);
        assert!(validator().validate(&container, &ctx()).is_ok());

        let strict =
            ContainerValidator::from_config(&StoreConfig::new().strict_domain_validation(true));
        assert!(matches!(
            strict.validate(&container, &ctx()),
            Err(IntegrityError::DomainViolation { .. })
        ));
    }
}
