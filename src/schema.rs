use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::model::Record;

/// Declares which record fields play which role in the history.
///
/// `current_flag_field` and `last_updated_field` are optional; leaving them out
/// switches that stamping off. `fields` is the declared record shape. When set,
/// every role must name a field inside it and carry-forward walks it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    pub key_fields: Vec<String>,
    pub timestamp_field: String,
    #[serde(default)]
    pub value_fields: Vec<String>,
    pub effective_from_field: String,
    pub effective_to_field: String,
    #[serde(default)]
    pub current_flag_field: Option<String>,
    #[serde(default)]
    pub last_updated_field: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl SchemaDescriptor {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn has_current_flag_field(&self) -> bool {
        self.current_flag_field.is_some()
    }

    pub fn has_last_updated_field(&self) -> bool {
        self.last_updated_field.is_some()
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.key_fields.is_empty() {
            return Err(PlanError::Configuration("no key fields declared".into()));
        }
        if self.timestamp_field.is_empty() {
            return Err(PlanError::Configuration("timestamp field name is empty".into()));
        }

        let boundaries = [&self.effective_from_field, &self.effective_to_field];
        if boundaries[0] == boundaries[1] {
            return Err(PlanError::Configuration(format!(
                "effective-from and effective-to both map to '{}'",
                boundaries[0]
            )));
        }
        for b in boundaries {
            if self.key_fields.contains(b) || self.value_fields.contains(b) {
                return Err(PlanError::Configuration(format!(
                    "boundary field '{}' is also a key or value field",
                    b
                )));
            }
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.key_fields.iter().find(|f| !seen.insert(f.as_str())) {
            return Err(PlanError::Configuration(format!("key field '{}' listed twice", dup)));
        }

        if let Some(shape) = &self.fields {
            let declared: HashSet<&str> = shape.iter().map(String::as_str).collect();
            if let Some(missing) = self.referenced_fields().find(|f| !declared.contains(f)) {
                return Err(PlanError::Configuration(format!(
                    "field '{}' is not part of the declared record shape",
                    missing
                )));
            }
        }
        Ok(())
    }

    /// Every field name the descriptor assigns a role to.
    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.key_fields
            .iter()
            .chain(std::iter::once(&self.timestamp_field))
            .chain(self.value_fields.iter())
            .chain([&self.effective_from_field, &self.effective_to_field])
            .chain(self.current_flag_field.iter())
            .chain(self.last_updated_field.iter())
            .map(String::as_str)
    }

    /// Fields considered for carry-forward from `previous` into `arrived`.
    pub(crate) fn shape_of(&self, arrived: &Record, previous: &Record) -> Vec<String> {
        match &self.fields {
            Some(shape) => shape.clone(),
            None => {
                let mut names: Vec<String> = arrived.field_names().map(str::to_string).collect();
                for name in previous.field_names() {
                    if !arrived.contains(name) {
                        names.push(name.to_string());
                    }
                }
                names
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    key_fields: Vec<String>,
    timestamp_field: String,
    value_fields: Vec<String>,
    effective_from_field: Option<String>,
    effective_to_field: Option<String>,
    current_flag_field: Option<String>,
    last_updated_field: Option<String>,
    fields: Option<Vec<String>>,
}

impl SchemaBuilder {
    pub fn key<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn timestamp(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn values<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.value_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn effective(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.effective_from_field = Some(from.into());
        self.effective_to_field = Some(to.into());
        self
    }

    pub fn current_flag(mut self, field: impl Into<String>) -> Self {
        self.current_flag_field = Some(field.into());
        self
    }

    pub fn last_updated(mut self, field: impl Into<String>) -> Self {
        self.last_updated_field = Some(field.into());
        self
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> SchemaDescriptor {
        SchemaDescriptor {
            key_fields: self.key_fields,
            timestamp_field: self.timestamp_field,
            value_fields: self.value_fields,
            effective_from_field: self.effective_from_field.unwrap_or_else(|| "effective_from".into()),
            effective_to_field: self.effective_to_field.unwrap_or_else(|| "effective_to".into()),
            current_flag_field: self.current_flag_field,
            last_updated_field: self.last_updated_field,
            fields: self.fields,
        }
    }
}
