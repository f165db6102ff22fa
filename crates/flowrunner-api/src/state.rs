//! Shared `AppState` threaded through every handler via axum's `State`
//! extractor (§10 "HTTP service scaffolding"). Generic over the
//! `StateStore` implementation so the same router wires up against the
//! in-memory store in tests and the Postgres store in production.

use std::sync::Arc;

use flowrunner_core::{Config, ExecutionEngine, StateStore, TriggerIngress};

use crate::graphs::GraphResolver;

pub struct AppState<S: StateStore> {
    pub engine: Arc<ExecutionEngine<S>>,
    pub ingress: Arc<TriggerIngress<S>>,
    pub graphs: Arc<GraphResolver>,
    pub config: Config,
}

impl<S: StateStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            ingress: self.ingress.clone(),
            graphs: self.graphs.clone(),
            config: self.config.clone(),
        }
    }
}
