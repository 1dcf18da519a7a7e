//! Legacy Flag Aliases
//!
//! Each sidecar used to define its own flag names for shared concepts
//! (`--csi-endpoint` vs `--csi-address`, `--workers` vs `--worker-threads`).
//! The alias map folds all of them onto one canonical flag of the
//! [`Configuration`](super::Configuration) and records how legacy readers
//! expect the value typed.
//!
//! When two spellings of the same field are supplied, the one that appears
//! last on the command line wins.

use clap::Command;
use serde::Serialize;
use std::time::Duration;

// =============================================================================
// Coercion
// =============================================================================

/// Conversion applied when a legacy consumer reads a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Value is read as stored
    Identity,
    /// 64-bit float storage exposed as a 32-bit float
    NarrowF32,
}

/// Narrow a 64-bit float to 32 bits without producing infinity.
///
/// Values representable in `f32` convert exactly. Finite values beyond the
/// `f32` range saturate to `±f32::MAX`. NaN and infinities pass through.
pub fn narrow_f32(value: f64) -> f32 {
    if !value.is_finite() {
        return value as f32;
    }
    let max = f32::MAX as f64;
    if value > max {
        f32::MAX
    } else if value < -max {
        f32::MIN
    } else {
        value as f32
    }
}

// =============================================================================
// Flag Values
// =============================================================================

/// Effective value of a flag as seen by a legacy reader
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    String(String),
    Bool(bool),
    #[serde(serialize_with = "super::serialize_duration")]
    Duration(Duration),
    Int(i64),
    Uint(u64),
    F64(f64),
    F32(f32),
}

impl FlagValue {
    /// Apply a coercion to this value
    pub fn coerce(self, coercion: Coercion) -> Self {
        match (coercion, self) {
            (Coercion::NarrowF32, FlagValue::F64(v)) => FlagValue::F32(narrow_f32(v)),
            (_, value) => value,
        }
    }
}

impl std::fmt::Display for FlagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagValue::String(v) => write!(f, "{}", v),
            FlagValue::Bool(v) => write!(f, "{}", v),
            FlagValue::Duration(v) => write!(f, "{}", humantime::format_duration(*v)),
            FlagValue::Int(v) => write!(f, "{}", v),
            FlagValue::Uint(v) => write!(f, "{}", v),
            FlagValue::F64(v) => write!(f, "{}", v),
            FlagValue::F32(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// Alias Map
// =============================================================================

/// One externally visible flag name and the canonical flag it resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alias {
    /// Name as given on the command line, without leading dashes
    pub name: &'static str,
    /// Long name of the canonical flag
    pub canonical: &'static str,
    /// Conversion for legacy readers
    pub coercion: Coercion,
}

impl Alias {
    const fn rename(name: &'static str, canonical: &'static str) -> Self {
        Self {
            name,
            canonical,
            coercion: Coercion::Identity,
        }
    }

    const fn narrow(canonical: &'static str) -> Self {
        Self {
            name: canonical,
            canonical,
            coercion: Coercion::NarrowF32,
        }
    }

    /// Whether this entry introduces a second flag name
    pub fn is_rename(&self) -> bool {
        self.name != self.canonical
    }
}

/// Flag names kept from the standalone sidecars
pub const LEGACY_ALIASES: &[Alias] = &[
    Alias::rename("csi-endpoint", "csi-address"),
    Alias::rename("resync-period", "resync"),
    Alias::rename("worker-threads", "attacher-worker-threads"),
    Alias::rename("workers", "attacher-worker-threads"),
    Alias::rename("timeout", "attacher-timeout"),
    Alias::rename("operation-timeout", "attacher-timeout"),
    Alias::rename("default-fstype", "attacher-default-fstype"),
    Alias::rename("max-entries", "attacher-max-entries"),
    Alias::rename("reconcile-sync", "attacher-reconcile-sync"),
    Alias::rename("max-grpc-log-length", "attacher-max-grpc-log-length"),
    Alias::narrow("kube-api-qps"),
    Alias::narrow("provisioner-kube-api-capacity-qps"),
];

/// Mapping from flag names to canonical flags and coercions
#[derive(Debug, Clone)]
pub struct AliasMap {
    entries: Vec<Alias>,
}

impl Default for AliasMap {
    fn default() -> Self {
        Self::legacy()
    }
}

impl AliasMap {
    /// Create an empty alias map
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Alias map covering the flag names of the standalone sidecars
    pub fn legacy() -> Self {
        Self {
            entries: LEGACY_ALIASES.to_vec(),
        }
    }

    /// Add an entry
    pub fn insert(&mut self, alias: Alias) {
        self.entries.push(alias);
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = &Alias> {
        self.entries.iter()
    }

    /// Iterate over entries that introduce a second flag name
    pub fn renames(&self) -> impl Iterator<Item = &Alias> {
        self.entries.iter().filter(|a| a.is_rename())
    }

    /// Resolve a flag name (canonical or alias, dashes optional) to its
    /// canonical flag and the coercion legacy readers expect
    pub fn resolve<'a>(&self, name: &'a str) -> (&'a str, Coercion) {
        let name = name.trim_start_matches('-');
        let canonical = self
            .entries
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.canonical)
            .unwrap_or(name);
        let coercion = self
            .entries
            .iter()
            .find(|a| a.canonical == canonical && !a.is_rename())
            .map(|a| a.coercion)
            .unwrap_or(Coercion::Identity);
        (canonical, coercion)
    }

    /// All alias names that resolve to `canonical`
    pub fn aliases_of<'a>(&'a self, canonical: &'a str) -> impl Iterator<Item = &'static str> + 'a {
        self.renames()
            .filter(move |a| a.canonical == canonical)
            .map(|a| a.name)
    }

    /// Register every rename against the canonical flag of `cmd`.
    ///
    /// Entries whose canonical flag is not declared on `cmd` are skipped.
    pub fn apply(&self, mut cmd: Command) -> Command {
        for alias in self.renames() {
            let id = cmd
                .get_arguments()
                .find(|arg| arg.get_long() == Some(alias.canonical))
                .map(|arg| arg.get_id().clone());

            if let Some(id) = id {
                cmd = cmd.mut_arg(id, |arg| arg.alias(alias.name));
            }
        }
        cmd
    }
}
