// cmh-core/src/cache/fingerprint.rs
//! Content-addressed keys for cache entries.

use std::collections::BTreeMap;

use cmh_common::model::ParameterValue;
use cmh_common::ResolvedModule;
use semver::Version;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over the module name, version and effective parameters.
///
/// Every field is fed as its byte length followed by its bytes, and
/// parameters go in key order as key then canonical value. Equal inputs hash
/// equally in every process, and the encoding is unambiguous: no field can
/// absorb a neighbour's separator.
pub fn fingerprint(name: &str, version: &Version, parameters: &BTreeMap<String, ParameterValue>) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, name.as_bytes());
    update_field(&mut hasher, version.to_string().as_bytes());
    for (key, value) in parameters {
        update_field(&mut hasher, key.as_bytes());
        update_field(&mut hasher, value.canonical().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

pub fn fingerprint_module(module: &ResolvedModule) -> String {
    fingerprint(&module.name, &module.version, &module.parameters)
}
