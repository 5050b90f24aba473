//! Translation between the canonical model and device dialects
//!
//! Each translator is a pure transform from one concrete message type to
//! another. The [`TranslatorRegistry`] selects the translator for a
//! `(source, target)` pair by type, so callers only name the types they hold
//! and the types they want.

mod request;
mod response;

pub use request::{CorrelatedRequest, RequestTranslator};
pub use devmgmt_shared::EXCEPTION_MESSAGE_METRIC;
pub use response::{CorrelationTranslator, ResponseTranslator};

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use devmgmt_shared::{DeviceMetric, MetricKind, MetricValue, Metrics};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// Routing or correlation headers are missing or malformed
    #[error("Invalid channel: {reason}")]
    InvalidChannel { reason: String, offending: String },

    /// Body, metrics or timestamp cannot be represented
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String, offending: String },

    #[error("No translator registered for {source_type} -> {target_type}")]
    NotRegistered {
        source_type: &'static str,
        target_type: &'static str,
    },
}

impl TranslationError {
    pub fn invalid_channel(reason: impl Into<String>, offending: &impl fmt::Debug) -> Self {
        TranslationError::InvalidChannel {
            reason: reason.into(),
            offending: format!("{offending:?}"),
        }
    }

    pub fn invalid_payload(reason: impl Into<String>, offending: &impl fmt::Debug) -> Self {
        TranslationError::InvalidPayload {
            reason: reason.into(),
            offending: format!("{offending:?}"),
        }
    }

    /// Debug rendering of the message that failed to translate
    pub fn offending_message(&self) -> Option<&str> {
        match self {
            TranslationError::InvalidChannel { offending, .. }
            | TranslationError::InvalidPayload { offending, .. } => Some(offending),
            TranslationError::NotRegistered { .. } => None,
        }
    }
}

/// A pure transform from `S` to `T`
pub trait Translator<S, T>: Send + Sync {
    fn translate(&self, source: &S) -> Result<T, TranslationError>;
}

/// Translators keyed by their concrete `(source, target)` types
#[derive(Default)]
pub struct TranslatorRegistry {
    translators: HashMap<(TypeId, TypeId), Box<dyn Any + Send + Sync>>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the binary device dialect in both directions
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RequestTranslator);
        registry.register(ResponseTranslator);
        registry.register(CorrelationTranslator);
        registry
    }

    /// Register a translator, replacing any earlier one for the same pair
    pub fn register<S, T, X>(&mut self, translator: X)
    where
        S: 'static,
        T: 'static,
        X: Translator<S, T> + 'static,
    {
        let entry: Arc<dyn Translator<S, T>> = Arc::new(translator);
        self.translators
            .insert((TypeId::of::<S>(), TypeId::of::<T>()), Box::new(entry));
    }

    pub fn supports<S: 'static, T: 'static>(&self) -> bool {
        self.translators
            .contains_key(&(TypeId::of::<S>(), TypeId::of::<T>()))
    }

    pub fn translate<S: 'static, T: 'static>(&self, source: &S) -> Result<T, TranslationError> {
        let translator = self
            .translators
            .get(&(TypeId::of::<S>(), TypeId::of::<T>()))
            .and_then(|entry| entry.downcast_ref::<Arc<dyn Translator<S, T>>>())
            .ok_or(TranslationError::NotRegistered {
                source_type: type_name::<S>(),
                target_type: type_name::<T>(),
            })?;
        translator.translate(source)
    }
}

/// Canonical metrics to dialect metrics
pub(crate) fn encode_metrics(metrics: &Metrics) -> Vec<DeviceMetric> {
    metrics
        .iter()
        .map(|(name, value)| {
            let mut metric = DeviceMetric {
                name: name.clone(),
                ..Default::default()
            };
            match value {
                MetricValue::String(s) => {
                    metric.kind = MetricKind::Text.into();
                    metric.text_value = s.clone();
                }
                MetricValue::Int(v) => {
                    metric.kind = MetricKind::Int32.into();
                    metric.int_value = i64::from(*v);
                }
                MetricValue::Long(v) => {
                    metric.kind = MetricKind::Int64.into();
                    metric.int_value = *v;
                }
                MetricValue::Double(v) => {
                    metric.kind = MetricKind::Double.into();
                    metric.double_value = *v;
                }
                MetricValue::Bool(v) => {
                    metric.kind = MetricKind::Boolean.into();
                    metric.bool_value = *v;
                }
                MetricValue::Bytes(v) => {
                    metric.kind = MetricKind::Blob.into();
                    metric.blob_value = v.clone();
                }
            }
            metric
        })
        .collect()
}

/// Dialect metrics to canonical metrics; names must be unique
pub(crate) fn decode_metrics(metrics: &[DeviceMetric]) -> Result<Metrics, TranslationError> {
    let mut decoded = Metrics::new();
    for metric in metrics {
        let kind = MetricKind::try_from(metric.kind).unwrap_or(MetricKind::Unspecified);
        let value = match kind {
            MetricKind::Text => MetricValue::String(metric.text_value.clone()),
            MetricKind::Int32 => {
                let v = i32::try_from(metric.int_value).map_err(|_| {
                    TranslationError::invalid_payload(
                        format!("metric '{}' overflows int32", metric.name),
                        metric,
                    )
                })?;
                MetricValue::Int(v)
            }
            MetricKind::Int64 => MetricValue::Long(metric.int_value),
            MetricKind::Double => MetricValue::Double(metric.double_value),
            MetricKind::Boolean => MetricValue::Bool(metric.bool_value),
            MetricKind::Blob => MetricValue::Bytes(metric.blob_value.clone()),
            MetricKind::Unspecified => {
                return Err(TranslationError::invalid_payload(
                    format!("metric '{}' has unknown kind {}", metric.name, metric.kind),
                    metric,
                ))
            }
        };
        if decoded.insert(metric.name.clone(), value).is_some() {
            return Err(TranslationError::invalid_payload(
                format!("duplicate metric '{}'", metric.name),
                metric,
            ));
        }
    }
    Ok(decoded)
}
