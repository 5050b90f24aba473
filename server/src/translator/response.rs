//! Device envelope to canonical response

use chrono::{DateTime, Utc};
use uuid::Uuid;

use devmgmt_shared::{
    CanonicalResponse, CorrelationHeaders, CorrelationId, DeviceChannel, DeviceEnvelope,
    MessageClass, Method, MetricValue, ResponseCode, EXCEPTION_MESSAGE_METRIC,
};

use super::{decode_metrics, TranslationError, Translator};

pub struct ResponseTranslator;

/// Extracts the correlation id of a reply without translating its payload
pub struct CorrelationTranslator;

fn response_channel(envelope: &DeviceEnvelope) -> Result<&DeviceChannel, TranslationError> {
    let channel = envelope
        .channel
        .as_ref()
        .ok_or_else(|| TranslationError::invalid_channel("missing channel", envelope))?;

    match MessageClass::try_from(channel.message_class) {
        Ok(MessageClass::Response) => {}
        _ => {
            return Err(TranslationError::invalid_channel(
                format!("message class {} is not a response", channel.message_class),
                envelope,
            ))
        }
    }
    if channel.tenant_id.is_empty() || channel.client_id.is_empty() {
        return Err(TranslationError::invalid_channel(
            "tenant and client id are required",
            envelope,
        ));
    }
    if channel.app_name.is_empty() {
        return Err(TranslationError::invalid_channel("app name is required", envelope));
    }
    Ok(channel)
}

impl Translator<DeviceEnvelope, CorrelationId> for CorrelationTranslator {
    fn translate(&self, source: &DeviceEnvelope) -> Result<CorrelationId, TranslationError> {
        let channel = response_channel(source)?;
        if channel.request_id.is_empty() {
            return Err(TranslationError::invalid_channel("missing request id", source));
        }
        let request_id = Uuid::parse_str(&channel.request_id).map_err(|e| {
            TranslationError::invalid_channel(
                format!("request id '{}' is not a UUID: {e}", channel.request_id),
                source,
            )
        })?;
        Ok(CorrelationId::new(
            &channel.tenant_id,
            &channel.client_id,
            request_id,
        ))
    }
}

impl Translator<DeviceEnvelope, CanonicalResponse> for ResponseTranslator {
    fn translate(&self, source: &DeviceEnvelope) -> Result<CanonicalResponse, TranslationError> {
        let channel = response_channel(source)?;

        let method = if channel.method.is_empty() {
            None
        } else {
            Some(
                Method::normalize(&channel.method)
                    .map_err(|e| TranslationError::invalid_channel(e.to_string(), source))?,
            )
        };

        let (captured_on, metrics, body) = match &source.payload {
            None => (Utc::now(), Default::default(), Vec::new()),
            Some(payload) => {
                let captured_on = if payload.timestamp_ms == 0 {
                    Utc::now()
                } else {
                    DateTime::<Utc>::from_timestamp_millis(payload.timestamp_ms).ok_or_else(
                        || {
                            TranslationError::invalid_payload(
                                format!("timestamp {} out of range", payload.timestamp_ms),
                                source,
                            )
                        },
                    )?
                };
                (
                    captured_on,
                    decode_metrics(&payload.metrics)?,
                    payload.body.clone(),
                )
            }
        };

        let exception_message = metrics
            .get(EXCEPTION_MESSAGE_METRIC)
            .and_then(MetricValue::as_text)
            .map(str::to_string);

        let headers = CorrelationHeaders {
            requester: channel.requester.clone(),
            request_id: channel.request_id.clone(),
            username: channel.username.clone(),
            client_id: channel.client_id.clone(),
            client_ip: channel.client_ip.clone(),
            connection_id: channel.connection_id.clone(),
            result_code: Some(channel.result_code),
            error_code: (!channel.error_code.is_empty()).then(|| channel.error_code.clone()),
        };

        Ok(CanonicalResponse {
            tenant_id: channel.tenant_id.clone(),
            device_id: channel.client_id.clone(),
            app_name: channel.app_name.clone(),
            app_version: channel.app_version.clone(),
            method,
            resource_path: channel.resource.clone(),
            body,
            metrics,
            captured_on,
            headers,
            code: ResponseCode::from_result_code(channel.result_code),
            exception_message,
        })
    }
}
