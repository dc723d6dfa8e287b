//! Routing of index requests onto per-embedder queues.
//!
//! The routing table is configured as `backend[:model]=queue` entries
//! separated by commas, e.g. `pe_core=tiles.pe,clip:ViT-B-32=tiles.clip_b32`.
//! A `backend:model` entry beats a plain `backend` entry; a request with no
//! embedder backend goes to every configured queue, whatever its model.
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::IndexRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouter {
    by_backend: HashMap<String, String>,
    by_backend_model: HashMap<(String, String), String>,
    all_queues: Vec<String>,
    broadcast_unrouted: bool,
}

fn entry_error(entry: &str) -> Error {
    Error::InvalidConfig(format!(
        "invalid routing entry '{}': use 'backend=queue' or 'backend:model=queue'",
        entry
    ))
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

impl QueueRouter {
    /// Parse a routing table. Later entries for the same key replace earlier ones.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut by_backend = HashMap::new();
        let mut by_backend_model = HashMap::new();
        let mut all_queues: Vec<String> = Vec::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, queue) = entry.split_once('=').ok_or_else(|| entry_error(entry))?;
            let (key, queue) = (key.trim(), queue.trim());
            if key.is_empty() || queue.is_empty() {
                return Err(entry_error(entry));
            }
            match key.split_once(':') {
                Some((backend, model)) => {
                    let (backend, model) = (backend.trim(), model.trim());
                    if backend.is_empty() || model.is_empty() {
                        return Err(entry_error(entry));
                    }
                    by_backend_model.insert((backend.to_string(), model.to_string()), queue.to_string());
                }
                None => {
                    by_backend.insert(key.to_string(), queue.to_string());
                }
            }
            if !all_queues.iter().any(|q| q == queue) {
                all_queues.push(queue.to_string());
            }
        }

        if all_queues.is_empty() {
            return Err(Error::InvalidConfig("routing table has no queues".into()));
        }
        Ok(Self { by_backend, by_backend_model, all_queues, broadcast_unrouted: true })
    }

    /// Turn broadcast of metadata-less requests on or off.
    pub fn with_broadcast(mut self, broadcast_unrouted: bool) -> Self {
        self.broadcast_unrouted = broadcast_unrouted;
        self
    }

    /// Every configured queue, in first-appearance order.
    pub fn queues(&self) -> &[String] {
        &self.all_queues
    }

    pub fn route(&self, backend: Option<&str>, model: Option<&str>) -> Result<Vec<String>> {
        let backend = non_blank(backend);
        let model = non_blank(model);

        let Some(backend) = backend else {
            if let Some(model) = model {
                tracing::debug!(model, "embedder_model without embedder_backend is not routable, broadcasting");
            }
            if !self.broadcast_unrouted {
                return Err(Error::Routing("request has no embedder metadata and broadcast is disabled".into()));
            }
            return Ok(self.all_queues.clone());
        };

        if let Some(model) = model {
            if let Some(queue) = self.by_backend_model.get(&(backend.to_string(), model.to_string())) {
                return Ok(vec![queue.clone()]);
            }
        }
        if let Some(queue) = self.by_backend.get(backend) {
            return Ok(vec![queue.clone()]);
        }
        Err(Error::Routing(format!(
            "no queue configured for embedder backend '{}' (model '{}')",
            backend,
            model.unwrap_or("")
        )))
    }

    pub fn route_request(&self, request: &IndexRequest) -> Result<Vec<String>> {
        self.route(request.embedder_backend.as_deref(), request.embedder_model.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_model_entry_wins_over_backend() {
        let router = QueueRouter::parse("clip=Q1, clip:ViT-B-32=Q2").expect("parse");
        assert_eq!(router.route(Some("clip"), Some("ViT-B-32")).expect("route"), vec!["Q2".to_string()]);
        assert_eq!(router.route(Some("clip"), Some("RN50")).expect("route"), vec!["Q1".to_string()]);
        assert_eq!(router.route(Some("clip"), None).expect("route"), vec!["Q1".to_string()]);
    }

    #[test]
    fn missing_metadata_broadcasts_to_all_queues_once() {
        let router = QueueRouter::parse("pe_core=Q1,clip=Q2,clip:ViT-B-32=Q3,siglip=Q1").expect("parse");
        assert_eq!(router.route(None, None).expect("route"), vec!["Q1", "Q2", "Q3"]);
        assert_eq!(router.route(Some("  "), Some("")).expect("route").len(), 3);
    }

    #[test]
    fn broadcast_can_be_disabled() {
        let router = QueueRouter::parse("a=Q1,b=Q2").expect("parse").with_broadcast(false);
        assert!(matches!(router.route(None, None), Err(Error::Routing(_))));
    }

    #[test]
    fn unknown_backend_is_a_routing_error() {
        let router = QueueRouter::parse("clip:ViT-B-32=Q2").expect("parse");
        assert!(matches!(router.route(Some("clip"), Some("RN50")), Err(Error::Routing(_))));
        assert!(matches!(router.route(Some("pe_core"), None), Err(Error::Routing(_))));
    }

    #[test]
    fn model_without_backend_is_treated_as_unrouted() {
        let router = QueueRouter::parse("clip:ViT-B-32=Q2,pe_core=Q1").expect("parse");
        assert_eq!(router.route(None, Some("ViT-B-32")).expect("route"), vec!["Q2", "Q1"]);
        assert_eq!(router.route(Some(" "), Some("ViT-B-32")).expect("route").len(), 2);

        let strict = router.with_broadcast(false);
        assert!(matches!(strict.route(None, Some("ViT-B-32")), Err(Error::Routing(_))));
    }

    #[test]
    fn malformed_tables_are_rejected() {
        for raw in ["", " , ", "clip", "clip=", "=Q1", ":m=Q1", "clip:=Q1"] {
            assert!(matches!(QueueRouter::parse(raw), Err(Error::InvalidConfig(_))), "{raw:?}");
        }
    }
}
