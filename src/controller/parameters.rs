use crate::checksum::parameters_checksum;
use crate::controller::reason;
use crate::handler::ReconcileError;
use crate::resource::{JsonObject, ObjectIdRef, ParametersFromSource, Secret};
use crate::store::Api;

use serde_json::Value;

/// Stands in for every value that came out of a secret
pub const REDACTED: &str = "<redacted>";

/// The parameters of an instance or binding, assembled from the inline parameters and every
/// `parametersFrom` source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    /// Sent to the broker, never stored
    pub values: Option<JsonObject>,
    /// Safe to store in status
    pub redacted: Option<Value>,
    pub checksum: Option<String>,
}

/// One parsed `parametersFrom` source
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourcedParameters {
    pub description: String,
    pub values: JsonObject,
}

/// Merges the inline parameters with the sourced ones. A key may only be defined once across
/// all of them.
pub(crate) fn merge_parameters(
    inline: Option<&Value>,
    sources: Vec<SourcedParameters>,
) -> Result<Parameters, String> {
    let mut values = JsonObject::new();
    let mut redacted = JsonObject::new();

    match inline {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (key, value) in map {
                values.insert(key.clone(), value.clone());
                redacted.insert(key.clone(), value.clone());
            }
        }
        Some(_) => return Err("inline parameters must be a JSON object".to_owned()),
    }

    for source in sources {
        for (key, value) in source.values {
            if values.contains_key(&key) {
                return Err(format!(
                    "the parameter {:?} from {} is already defined elsewhere",
                    key, source.description
                ));
            }
            redacted.insert(key.clone(), Value::String(REDACTED.to_owned()));
            values.insert(key, value);
        }
    }

    if values.is_empty() && inline.map(Value::is_null).unwrap_or(true) {
        return Ok(Parameters::default());
    }
    let checksum = parameters_checksum(&Value::Object(values.clone()));
    Ok(Parameters {
        values: Some(values),
        redacted: Some(Value::Object(redacted)),
        checksum: Some(checksum),
    })
}

/// The default provision parameters of a class and plan. Plan defaults win over the class ones.
pub(crate) fn catalog_defaults(class_defaults: Option<&Value>, plan_defaults: Option<&Value>) -> Option<Value> {
    match (class_defaults, plan_defaults) {
        (None, None) => None,
        (Some(defaults), None) | (None, Some(defaults)) => Some(defaults.clone()),
        (Some(class_defaults), Some(plan_defaults)) => {
            let mut merged = class_defaults.clone();
            json_patch::merge(&mut merged, plan_defaults);
            Some(merged)
        }
    }
}

/// Merges the parameters over the defaults, key by key. Nested objects merge too, and a `null`
/// parameter drops the default of that key. Defaults are never secret, so they're stored as is.
pub(crate) fn apply_defaults(params: Parameters, defaults: Option<&Value>) -> Result<Parameters, String> {
    let defaults = match defaults {
        None | Some(Value::Null) => return Ok(params),
        Some(Value::Object(map)) if map.is_empty() => return Ok(params),
        Some(defaults @ Value::Object(_)) => defaults,
        Some(_) => return Err("default provision parameters must be a JSON object".to_owned()),
    };
    let mut values = defaults.clone();
    let mut redacted = defaults.clone();
    if let Some(explicit) = params.values {
        json_patch::merge(&mut values, &Value::Object(explicit));
    }
    if let Some(explicit) = params.redacted.as_ref() {
        json_patch::merge(&mut redacted, explicit);
    }
    let checksum = parameters_checksum(&values);
    let values = match values {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    };
    Ok(Parameters {
        values: Some(values),
        redacted: Some(redacted),
        checksum: Some(checksum),
    })
}

/// Reads every `parametersFrom` secret out of the namespace and merges the result with the
/// inline parameters. A secret that doesn't exist yet is retried. Anything that can only be
/// fixed by changing the spec is a user error.
pub(crate) async fn build_parameters(
    secrets: &Api<Secret>,
    namespace: &str,
    inline: Option<&Value>,
    from: &[ParametersFromSource],
) -> Result<Parameters, ReconcileError> {
    let mut sources = Vec::with_capacity(from.len());
    for source in from {
        let key_ref = match source.secret_key_ref.as_ref() {
            Some(key_ref) => key_ref,
            None => {
                return Err(ReconcileError::user(
                    reason::ERROR_WITH_PARAMETERS,
                    "parametersFrom entries must set secretKeyRef",
                ))
            }
        };
        let id = ObjectIdRef::new(namespace, key_ref.name.as_str());
        let secret = secrets.get(&id).await?.ok_or_else(|| {
            ReconcileError::transient(
                reason::ERROR_WITH_PARAMETERS,
                format!("failed to get parameters from secret {}: not found", id),
            )
        })?;
        let raw = match secret.get_decoded(&key_ref.key) {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                return Err(ReconcileError::user(
                    reason::ERROR_WITH_PARAMETERS,
                    format!("secret {} key {:?} is not valid base64: {}", id, key_ref.key, err),
                ))
            }
            None => {
                return Err(ReconcileError::user(
                    reason::ERROR_WITH_PARAMETERS,
                    format!("secret {} has no key {:?}", id, key_ref.key),
                ))
            }
        };
        let values = match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(ReconcileError::user(
                    reason::ERROR_WITH_PARAMETERS,
                    format!(
                        "secret {} key {:?} does not hold a JSON object",
                        id, key_ref.key
                    ),
                ))
            }
        };
        sources.push(SourcedParameters {
            description: format!("secret {} key {:?}", id, key_ref.key),
            values,
        });
    }
    merge_parameters(inline, sources)
        .map_err(|msg| ReconcileError::user(reason::ERROR_WITH_PARAMETERS, msg))
}
