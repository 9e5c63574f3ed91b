use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::{EventType, RelayEvent};

use crate::args::TransactionArgs;
use crate::error::{TranslateError, TranslateResult};

/// Maps a relay event onto target transaction arguments.
///
/// Implementations must be pure: the same event always yields the same
/// arguments or the same error.
pub trait Translator: Send + Sync {
    fn translate(&self, event: &RelayEvent) -> TranslateResult<TransactionArgs>;
}

/// Target function and required payload fields for one event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMapping {
    pub event_type: EventType,
    pub function: String,
    /// Payload fields passed positionally after the key, in this order.
    pub fields: Vec<String>,
}

impl FunctionMapping {
    pub fn new(event_type: EventType, function: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            event_type,
            function: function.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Translator driven by a table of [`FunctionMapping`]s.
///
/// The payload must be a JSON object; each required field must be a string
/// or a number.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMappingTranslator {
    mappings: Vec<FunctionMapping>,
}

impl FieldMappingTranslator {
    pub fn new(mappings: Vec<FunctionMapping>) -> Self {
        Self { mappings }
    }

    /// Mapping for the car registry contracts used by the demo ledgers.
    pub fn car_registry() -> Self {
        Self::new(vec![
            FunctionMapping::new(
                EventType::Created,
                "createCar",
                &["make", "model", "colour", "owner"],
            ),
            FunctionMapping::new(
                EventType::Updated,
                "updateCar",
                &["make", "model", "colour", "owner"],
            ),
            FunctionMapping::new(EventType::Transferred, "changeCarOwner", &["owner"]),
            FunctionMapping::new(EventType::Deleted, "deleteCar", &[]),
        ])
    }

    pub fn mappings(&self) -> &[FunctionMapping] {
        &self.mappings
    }

    fn mapping_for(&self, event_type: &EventType) -> Option<&FunctionMapping> {
        self.mappings.iter().find(|m| &m.event_type == event_type)
    }
}

fn field_as_arg(object: &serde_json::Map<String, Value>, field: &str) -> TranslateResult<String> {
    match object.get(field) {
        None | Some(Value::Null) => Err(TranslateError::MissingField(field.to_string())),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(TranslateError::InvalidField {
            field: field.to_string(),
        }),
    }
}

impl Translator for FieldMappingTranslator {
    fn translate(&self, event: &RelayEvent) -> TranslateResult<TransactionArgs> {
        let mapping = self
            .mapping_for(event.event_type())
            .ok_or_else(|| TranslateError::Unmapped(event.event_type().clone()))?;

        let value: Value = serde_json::from_slice(event.payload())
            .map_err(|e| TranslateError::NotJson(e.to_string()))?;
        let object = value.as_object().ok_or(TranslateError::NotAnObject)?;

        let args = mapping
            .fields
            .iter()
            .map(|field| field_as_arg(object, field))
            .collect::<TranslateResult<Vec<_>>>()?;

        Ok(TransactionArgs {
            function: mapping.function.clone(),
            key: event.source_record_key().to_string(),
            args,
            event_id: event.id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_types::SourceIdentity;

    fn event(name: &str, payload: &[u8]) -> RelayEvent {
        RelayEvent::new(
            SourceIdentity::new("tx-1", name, 0),
            "CAR10",
            EventType::from_event_name(name),
            payload.to_vec(),
            Utc::now(),
        )
    }

    #[test]
    fn translates_created_event() {
        let e = event(
            "CarCreated",
            br#"{"make":"Toyota","model":"Prius","colour":"blue","owner":"Tomoko","year":2019}"#,
        );
        let args = FieldMappingTranslator::car_registry().translate(&e).unwrap();

        assert_eq!(args.function, "createCar");
        assert_eq!(args.key, "CAR10");
        assert_eq!(args.args, vec!["Toyota", "Prius", "blue", "Tomoko"]);
        assert_eq!(args.event_id, e.id());
    }

    #[test]
    fn numbers_are_stringified() {
        let translator = FieldMappingTranslator::new(vec![FunctionMapping::new(
            EventType::Updated,
            "setMileage",
            &["km"],
        )]);
        let args = translator
            .translate(&event("CarUpdated", br#"{"km":120500}"#))
            .unwrap();
        assert_eq!(args.args, vec!["120500"]);
    }

    #[test]
    fn missing_field_is_malformed() {
        let e = event("CarCreated", br#"{"make":"Toyota","model":"Prius","owner":"Tomoko"}"#);
        assert_eq!(
            FieldMappingTranslator::car_registry().translate(&e),
            Err(TranslateError::MissingField("colour".into()))
        );
    }

    #[test]
    fn null_counts_as_missing() {
        let e = event("CarTransferred", br#"{"owner":null}"#);
        assert_eq!(
            FieldMappingTranslator::car_registry().translate(&e),
            Err(TranslateError::MissingField("owner".into()))
        );
    }

    #[test]
    fn ill_typed_field_is_malformed() {
        let e = event("CarTransferred", br#"{"owner":{"name":"Max"}}"#);
        assert_eq!(
            FieldMappingTranslator::car_registry().translate(&e),
            Err(TranslateError::InvalidField {
                field: "owner".into()
            })
        );
    }

    #[test]
    fn non_json_and_non_object_payloads() {
        let translator = FieldMappingTranslator::car_registry();
        assert!(matches!(
            translator.translate(&event("CarCreated", b"not json")),
            Err(TranslateError::NotJson(_))
        ));
        assert_eq!(
            translator.translate(&event("CarCreated", b"[1,2]")),
            Err(TranslateError::NotAnObject)
        );
    }

    #[test]
    fn unmapped_event_type() {
        let e = event("CarInspected", b"{}");
        assert_eq!(
            FieldMappingTranslator::car_registry().translate(&e),
            Err(TranslateError::Unmapped(EventType::Other("CarInspected".into())))
        );
    }

    #[test]
    fn delete_needs_no_fields() {
        let args = FieldMappingTranslator::car_registry()
            .translate(&event("CarDeleted", b"{}"))
            .unwrap();
        assert_eq!(args.function, "deleteCar");
        assert!(args.args.is_empty());
    }
}
