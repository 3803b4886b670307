//! Cache key derivation

use kiln_core::{
    CacheKey, ContentHash, Implementation, OutputLocation, TreeType, CACHE_ENTRY_FORMAT_VERSION,
};
use kiln_fingerprint::Fingerprint;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Everything a cache key is derived from
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyInputs<'a> {
    pub implementation: &'a Implementation,
    pub inputs: &'a BTreeMap<String, Fingerprint>,
    pub outputs: &'a BTreeMap<String, OutputLocation>,
    /// Digest over the dependencies' outputs, when dependencies are tracked
    pub upstream: Option<&'a ContentHash>,
}

/// Derives deterministic cache keys.
///
/// Properties are digested in name order, so the order in which they were
/// declared never affects the key. Output locations contribute their names
/// and shapes but not their paths, which keeps keys valid across checkouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, inputs: &CacheKeyInputs<'_>) -> CacheKey {
        let mut hasher = Sha256::new();
        field(&mut hasher, "kiln-build-cache");
        field(&mut hasher, &CACHE_ENTRY_FORMAT_VERSION.to_string());

        field(&mut hasher, "implementation");
        field(&mut hasher, &inputs.implementation.type_name);
        field(&mut hasher, &inputs.implementation.version);

        // BTreeMap iteration is name order
        for (name, fingerprint) in inputs.inputs {
            field(&mut hasher, "input");
            field(&mut hasher, name);
            field(&mut hasher, fingerprint.hash().as_str());
        }

        for (name, location) in inputs.outputs {
            field(&mut hasher, "output");
            field(&mut hasher, name);
            field(
                &mut hasher,
                match location.tree {
                    TreeType::File => "file",
                    TreeType::Directory => "directory",
                },
            );
        }

        if let Some(upstream) = inputs.upstream {
            field(&mut hasher, "upstream");
            field(&mut hasher, upstream.as_str());
        }

        CacheKey::from_hash(ContentHash::finish(hasher))
    }
}

fn field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
