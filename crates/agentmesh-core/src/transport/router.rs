//! Topic-keyed handler table shared by every transport.
//!
//! Each subscription registers its own handler under its topic filter, so a
//! connection that listens on several topics never has to re-derive "which
//! topic is this" inside one global callback. Filters follow MQTT rules:
//! `+` matches one level, a trailing `#` matches any remainder.

use std::sync::{Arc, RwLock};

use crate::message::{Envelope, QoS};

/// Callback invoked on the transport's dispatch task for every matching message.
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

struct Route {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

#[derive(Clone, Default)]
pub struct TopicRouter {
    routes: Arc<RwLock<Vec<Route>>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`. Returns `true` when an existing
    /// handler for the same filter was replaced.
    pub fn insert(&self, filter: &str, qos: QoS, handler: MessageHandler) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(route) = routes.iter_mut().find(|r| r.filter == filter) {
            route.qos = qos;
            route.handler = handler;
            return true;
        }
        routes.push(Route {
            filter: filter.to_string(),
            qos,
            handler,
        });
        false
    }

    pub fn remove(&self, filter: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let before = routes.len();
        routes.retain(|r| r.filter != filter);
        routes.len() != before
    }

    pub fn contains(&self, filter: &str) -> bool {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().any(|r| r.filter == filter)
    }

    /// Every registered filter with its QoS, used for resubscription.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().map(|r| (r.filter.clone(), r.qos)).collect()
    }

    pub fn matches(&self, topic: &str) -> bool {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes.iter().any(|r| topic_matches(&r.filter, topic))
    }

    /// Invoke every handler whose filter matches the envelope's topic.
    /// Returns the number of handlers called.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        // Handlers are cloned out so one may (un)subscribe without deadlocking.
        let handlers: Vec<MessageHandler> = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .filter(|r| topic_matches(&r.filter, &envelope.topic))
                .map(|r| r.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            tracing::debug!("[Router] No handler for topic '{}'", envelope.topic);
            return 0;
        }

        for handler in &handlers {
            handler(envelope.clone());
        }
        handlers.len()
    }
}

/// MQTT topic filter matching.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
