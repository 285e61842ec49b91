//! Content fingerprints over the user-significant portion of instance and binding specs.
//!
//! The fingerprint is a hex encoded SHA-256 over a line oriented canonical form. Fields that are
//! absent are left out of the canonical form entirely, so adding a new optional field never
//! changes the fingerprint of existing objects. Any change to the canonical form must bump
//! `CHECKSUM_VERSION`, which is stored next to every checksum.
use crate::resource::{ParametersFromSource, ResolvedReferences, ServiceBinding, ServiceInstance};

use serde_json::Value;
use sha2::{Digest, Sha256};

use std::fmt::Write;

pub const CHECKSUM_VERSION: u32 = 1;

/// Fingerprint of an instance spec, using the class and plan it resolved to
pub fn instance_spec_checksum(instance: &ServiceInstance, resolved: &ResolvedReferences) -> String {
    let mut canonical = String::with_capacity(256);
    push_line(&mut canonical, "serviceClassRef", &resolved.class_name);
    push_line(&mut canonical, "servicePlanRef", &resolved.plan_name);
    push_parameters(
        &mut canonical,
        instance.spec.parameters.as_ref(),
        &instance.spec.parameters_from,
    );
    if !instance.spec.external_id.is_empty() {
        push_line(&mut canonical, "externalID", &instance.spec.external_id);
    }
    sha256_hex(canonical.as_bytes())
}

pub fn binding_spec_checksum(binding: &ServiceBinding) -> String {
    let mut canonical = String::with_capacity(256);
    push_line(&mut canonical, "instanceRef", &binding.spec.instance_ref.name);
    push_parameters(
        &mut canonical,
        binding.spec.parameters.as_ref(),
        &binding.spec.parameters_from,
    );
    if !binding.spec.external_id.is_empty() {
        push_line(&mut canonical, "externalID", &binding.spec.external_id);
    }
    sha256_hex(canonical.as_bytes())
}

/// Fingerprint of an already assembled parameters object, used to notice changes in secret
/// sourced values that the spec checksum can't see
pub fn parameters_checksum(parameters: &Value) -> String {
    sha256_hex(canonical_json(parameters).as_bytes())
}

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

fn push_line(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "{}: {}", key, value);
}

fn push_parameters(out: &mut String, parameters: Option<&Value>, from: &[ParametersFromSource]) {
    if let Some(params) = parameters {
        out.push_str("parameters:\n");
        out.push_str(&canonical_json(params));
        out.push('\n');
    }
    if !from.is_empty() {
        out.push_str("parametersFrom:\n");
        for source in from {
            let _ = writeln!(out, "- {}", parameters_from_checksum(source));
        }
    }
}

fn parameters_from_checksum(source: &ParametersFromSource) -> String {
    let mut canonical = String::new();
    if let Some(key_ref) = source.secret_key_ref.as_ref() {
        push_line(&mut canonical, "secretKeyRef.name", &key_ref.name);
        push_line(&mut canonical, "secretKeyRef.key", &key_ref.key);
    }
    sha256_hex(canonical.as_bytes())
}

/// Serializes with object keys in sorted order at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
