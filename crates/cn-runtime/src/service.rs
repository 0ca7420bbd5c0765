use std::collections::BTreeMap;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// ServiceHandler — the invocation contract with the business service
// ---------------------------------------------------------------------------

/// How a service invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceFailure {
    /// Worth retrying with backoff.
    #[error("transient service failure: {0}")]
    Transient(String),
    /// Not retried; the token goes to the error sink.
    #[error("permanent service failure: {0}")]
    Permanent(String),
}

/// The local business service behind this control node.
///
/// Input is restricted to the attributes declared as required by the
/// operation's canonical bindings; output must stay within the declared
/// produced set. The worker enforces both sides of that contract — a
/// handler never sees undeclared attributes and never smuggles any out.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn invoke(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ServiceFailure>;
}

// ---------------------------------------------------------------------------
// PassThroughService
// ---------------------------------------------------------------------------

/// Default handler: produces every declared output attribute by copying the
/// first input value (or a fixed marker when the input is empty).
///
/// Stands in for a real business service in demos and tests; the `run`
/// command wires it in when no embedding application supplies a handler.
pub struct PassThroughService {
    produced: Vec<String>,
}

impl PassThroughService {
    pub fn new(produced: Vec<String>) -> Self {
        Self { produced }
    }
}

#[async_trait]
impl ServiceHandler for PassThroughService {
    async fn invoke(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ServiceFailure> {
        let carried = attributes
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| "done".to_string());
        if self.produced.is_empty() {
            // No declared outputs: echo the input unchanged.
            return Ok(attributes.clone());
        }
        Ok(self
            .produced
            .iter()
            .map(|name| (name.clone(), carried.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn passthrough_produces_declared_outputs() {
        let svc = PassThroughService::new(vec!["severity".into()]);
        let out = svc.invoke(&attrs(&[("vitals", "stable")])).await.unwrap();
        assert_eq!(out, attrs(&[("severity", "stable")]));
    }

    #[tokio::test]
    async fn passthrough_echoes_without_declared_outputs() {
        let svc = PassThroughService::new(vec![]);
        let input = attrs(&[("a", "1"), ("b", "2")]);
        assert_eq!(svc.invoke(&input).await.unwrap(), input);
    }
}
