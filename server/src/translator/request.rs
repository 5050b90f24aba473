//! Canonical request to device envelope

use devmgmt_shared::{
    CanonicalRequest, CorrelationId, DeviceChannel, DeviceEnvelope, DevicePayload, MessageClass,
};

use super::{encode_metrics, TranslationError, Translator};

/// A canonical request paired with the correlation id it is sent under
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedRequest {
    pub correlation_id: CorrelationId,
    pub request: CanonicalRequest,
}

impl CorrelatedRequest {
    /// Pair a request with a freshly generated correlation id
    pub fn new(request: CanonicalRequest) -> Self {
        let correlation_id = CorrelationId::generate(&request.tenant_id, &request.device_id);
        Self {
            correlation_id,
            request,
        }
    }

    pub fn with_id(correlation_id: CorrelationId, request: CanonicalRequest) -> Self {
        Self {
            correlation_id,
            request,
        }
    }
}

pub struct RequestTranslator;

impl Translator<CorrelatedRequest, DeviceEnvelope> for RequestTranslator {
    fn translate(&self, source: &CorrelatedRequest) -> Result<DeviceEnvelope, TranslationError> {
        let request = &source.request;

        if request.tenant_id.is_empty() || request.device_id.is_empty() {
            return Err(TranslationError::invalid_channel(
                "tenant and device id are required",
                request,
            ));
        }
        if request.app_name.is_empty() {
            return Err(TranslationError::invalid_channel("app name is required", request));
        }
        if source.correlation_id.tenant_id != request.tenant_id
            || source.correlation_id.device_id != request.device_id
        {
            return Err(TranslationError::invalid_channel(
                format!(
                    "correlation id {} does not address {}/{}",
                    source.correlation_id, request.tenant_id, request.device_id
                ),
                request,
            ));
        }
        if request.metrics.keys().any(|name| name.is_empty()) {
            return Err(TranslationError::invalid_payload("metric names must not be empty", request));
        }

        let channel = DeviceChannel {
            message_class: MessageClass::Request.into(),
            tenant_id: request.tenant_id.clone(),
            client_id: request.device_id.clone(),
            app_name: request.app_name.clone(),
            app_version: request.app_version.clone(),
            method: request.method.device_alias().to_string(),
            resource: request.resource_path.clone(),
            requester: request.requester.clone(),
            request_id: source.correlation_id.request_id.to_string(),
            username: request.username.clone(),
            ..Default::default()
        };

        let payload = DevicePayload {
            timestamp_ms: request.captured_on.timestamp_millis(),
            metrics: encode_metrics(&request.metrics),
            body: request.body.clone(),
        };

        Ok(DeviceEnvelope {
            channel: Some(channel),
            payload: Some(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmgmt_shared::{Method, MetricKind};

    fn keystore_delete() -> CanonicalRequest {
        CanonicalRequest::new("1", "gw-01", "KEYS-V1", Method::Delete)
            .with_resource(["items", "ssl-cert"])
            .with_requester("job-engine")
            .with_metric("alias", "ssl-cert")
    }

    #[test]
    fn test_request_uses_device_method_alias() {
        let source = CorrelatedRequest::new(keystore_delete());
        let envelope = RequestTranslator.translate(&source).unwrap();
        let channel = envelope.channel.unwrap();

        assert_eq!(channel.method, "DEL");
        assert_eq!(channel.message_class, MessageClass::Request as i32);
        assert_eq!(channel.client_id, "gw-01");
        assert_eq!(channel.resource, vec!["items", "ssl-cert"]);
        assert_eq!(channel.request_id, source.correlation_id.request_id.to_string());
    }

    #[test]
    fn test_request_payload_carries_metrics_and_timestamp() {
        let request = keystore_delete().with_body("payload");
        let captured = request.captured_on.timestamp_millis();
        let envelope = RequestTranslator
            .translate(&CorrelatedRequest::new(request))
            .unwrap();
        let payload = envelope.payload.unwrap();

        assert_eq!(payload.timestamp_ms, captured);
        assert_eq!(payload.body, b"payload");
        assert_eq!(payload.metrics.len(), 1);
        assert_eq!(payload.metrics[0].kind, MetricKind::Text as i32);
    }

    #[test]
    fn test_empty_body_is_not_an_error() {
        let envelope = RequestTranslator
            .translate(&CorrelatedRequest::new(CanonicalRequest::new(
                "1",
                "gw-01",
                "DEPLOY-V2",
                Method::Read,
            )))
            .unwrap();
        assert!(envelope.payload.unwrap().body.is_empty());
    }

    #[test]
    fn test_missing_app_name_is_invalid_channel() {
        let request = CanonicalRequest::new("1", "gw-01", "", Method::Read);
        let err = RequestTranslator
            .translate(&CorrelatedRequest::new(request))
            .unwrap_err();
        assert!(matches!(err, TranslationError::InvalidChannel { .. }));
        assert!(err.offending_message().unwrap().contains("gw-01"));
    }

    #[test]
    fn test_correlation_id_must_address_same_device() {
        let request = keystore_delete();
        let source = CorrelatedRequest::with_id(CorrelationId::generate("1", "other"), request);
        assert!(matches!(
            RequestTranslator.translate(&source),
            Err(TranslationError::InvalidChannel { .. })
        ));
    }
}
