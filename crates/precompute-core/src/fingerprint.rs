use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::config::FingerprintConfig;
use crate::{KernelError, Watermark};

/// Tag mixed into every digest. Changing the canonical encoding means bumping it.
pub const FINGERPRINT_FORMAT: &str = "precompute.fingerprint.v1";

const MAX_PARAMS: usize = 256;
const MAX_NAME_LEN: usize = 128;
const MAX_VALUE_LEN: usize = 4096;

/// SHA-256 digest identifying one cacheable computation request.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0_u8; 32];
        hex::decode_to_slice(value.trim(), &mut bytes)
            .map_err(|err| KernelError::Validation(format!("invalid fingerprint {value:?}: {err}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Scalar(String),
    Integer(i64),
    Flag(bool),
    /// Multi-valued parameter; order carries no meaning.
    List(Vec<String>),
    /// Entity identifiers (repositories, teams, ...); canonicalized ascending.
    EntityIds(Vec<u64>),
}

impl ParamValue {
    fn normalized(&self) -> Self {
        match self {
            Self::List(values) => {
                let set: BTreeSet<&String> = values.iter().collect();
                Self::List(set.into_iter().cloned().collect())
            }
            Self::EntityIds(ids) => {
                let set: BTreeSet<u64> = ids.iter().copied().collect();
                Self::EntityIds(set.into_iter().collect())
            }
            other => other.clone(),
        }
    }

    fn validate(&self, name: &str) -> Result<(), KernelError> {
        match self {
            Self::Scalar(value) => validate_value(name, value),
            Self::List(values) => values.iter().try_for_each(|value| validate_value(name, value)),
            Self::Integer(_) | Self::Flag(_) | Self::EntityIds(_) => Ok(()),
        }
    }
}

/// Named query parameters. Names are unique by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_scalar(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, ParamValue::Scalar(value.into()))
    }

    #[must_use]
    pub fn with_list<I, S>(self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(name, ParamValue::List(values.into_iter().map(Into::into).collect()))
    }

    #[must_use]
    pub fn with_entity_ids(self, name: impl Into<String>, ids: impl IntoIterator<Item = u64>) -> Self {
        self.with(name, ParamValue::EntityIds(ids.into_iter().collect()))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One analytic request as seen by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricQuery {
    /// Metric family, e.g. `pr-lead-time`.
    pub kind: String,
    #[serde(default)]
    pub params: QueryParams,
    /// Lower bound on the upstream watermark the answer must reflect.
    #[serde(default)]
    pub min_watermark: Option<Watermark>,
    /// Requested artifact lifetime; the configured default applies when absent.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl MetricQuery {
    #[must_use]
    pub fn new(kind: impl Into<String>, params: QueryParams) -> Self {
        Self { kind: kind.into(), params, min_watermark: None, ttl_secs: None }
    }

    #[must_use]
    pub fn with_min_watermark(mut self, watermark: Watermark) -> Self {
        self.min_watermark = Some(watermark);
        self
    }

    #[must_use]
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

#[derive(Serialize)]
struct CanonicalQuery<'a> {
    format: &'static str,
    schema_version: u32,
    kind: &'a str,
    watermark_bucket: u64,
    params: BTreeMap<&'a str, ParamValue>,
}

/// Derives stable cache keys from queries. Pure and deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintComputer {
    schema_version: u32,
    watermark_bucket: u64,
    ignored_params: BTreeSet<String>,
}

impl FingerprintComputer {
    #[must_use]
    pub fn new(schema_version: u32, watermark_bucket: u64) -> Self {
        Self { schema_version, watermark_bucket, ignored_params: BTreeSet::new() }
    }

    #[must_use]
    pub fn from_config(config: &FingerprintConfig) -> Self {
        Self {
            schema_version: config.schema_version,
            watermark_bucket: config.watermark_bucket,
            ignored_params: config.ignored_params.iter().cloned().collect(),
        }
    }

    /// Mark a parameter as having no effect on the computed output.
    #[must_use]
    pub fn ignoring(mut self, name: impl Into<String>) -> Self {
        self.ignored_params.insert(name.into());
        self
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Watermarks per fingerprint bucket.
    #[must_use]
    pub fn bucket_size(&self) -> u64 {
        self.watermark_bucket.max(1)
    }

    /// Canonical JSON text that is hashed into the fingerprint.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for malformed kinds, names or values.
    pub fn canonical_form(
        &self,
        query: &MetricQuery,
        watermark: Watermark,
    ) -> Result<String, KernelError> {
        validate_query(query)?;
        let params = query
            .params
            .iter()
            .filter(|(name, _)| !self.ignored_params.contains(name.as_str()))
            .map(|(name, value)| (name.as_str(), value.normalized()))
            .collect();
        let canonical = CanonicalQuery {
            format: FINGERPRINT_FORMAT,
            schema_version: self.schema_version,
            kind: &query.kind,
            watermark_bucket: watermark.bucket(self.watermark_bucket),
            params,
        };
        serde_json::to_string(&canonical)
            .map_err(|err| KernelError::Validation(format!("query is not serializable: {err}")))
    }

    /// Compute the fingerprint of `query` observed at `watermark`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for malformed kinds, names or values.
    pub fn fingerprint(
        &self,
        query: &MetricQuery,
        watermark: Watermark,
    ) -> Result<Fingerprint, KernelError> {
        let canonical = self.canonical_form(query, watermark)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(Fingerprint(digest.into()))
    }
}

fn validate_query(query: &MetricQuery) -> Result<(), KernelError> {
    validate_name("query kind", &query.kind)?;
    if query.params.len() > MAX_PARAMS {
        return Err(KernelError::Validation(format!(
            "query has {} parameters; at most {MAX_PARAMS} are accepted",
            query.params.len()
        )));
    }
    for (name, value) in query.params.iter() {
        validate_name("parameter name", name)?;
        value.validate(name)?;
    }
    Ok(())
}

fn validate_name(what: &str, name: &str) -> Result<(), KernelError> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'.'));
    if well_formed {
        Ok(())
    } else {
        Err(KernelError::Validation(format!(
            "{what} {name:?} must be 1..={MAX_NAME_LEN} chars of [a-z0-9._-]"
        )))
    }
}

fn validate_value(name: &str, value: &str) -> Result<(), KernelError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(KernelError::Validation(format!(
            "value of {name} exceeds {MAX_VALUE_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(KernelError::Validation(format!("value of {name} contains control characters")));
    }
    Ok(())
}
