//! The formula-driven derived-point engine.
//!
//! Mappings bind one target point to an expression over source points
//! that may live on other devices. Source subscriptions are keyed on
//! point identity, so a rename never detaches a mapping. Evaluations run
//! on a bounded single-worker queue: strictly FIFO, never interleaved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::FORMULA_QUEUE_DEPTH;
use crate::core::point::Point;
use crate::core::signal::{next_subscriber_id, PointId, SubscriberId};
use crate::formula::ast::{self, Expr};

/// One source of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSource {
    pub device_name: String,
    pub point_code: String,
    /// Name the source goes by inside the expression.
    pub alias: String,
}

/// A formula mapping row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: i64,
    /// Device owning the target point.
    pub device_name: String,
    pub target_point_code: String,
    pub sources: Vec<MappingSource>,
    pub expression: String,
    pub enabled: bool,
}

/// Cross-device point lookup and write-back, provided by the controller.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Resolve a point by device name and point code.
    fn resolve_point(&self, device_name: &str, point_code: &str) -> Option<Arc<Point>>;

    /// Write an engineering value through the owning runtime, so the
    /// wire representation follows the point model.
    async fn write_point_value(&self, device_name: &str, point_code: &str, value: f64) -> bool;
}

struct ActiveMapping {
    row: Mapping,
    /// Parsed once per session; a parse failure disables the mapping.
    expr: Expr,
}

#[derive(Default)]
struct EngineState {
    mappings: HashMap<i64, ActiveMapping>,
    /// Source point identity → mappings it feeds.
    sender_map: HashMap<PointId, Vec<i64>>,
    /// Live subscriptions, for clean re-loads.
    subscriptions: Vec<(Arc<Point>, SubscriberId)>,
}

/// The per-device formula engine.
pub struct FormulaEngine {
    device_name: String,
    self_ref: Weak<FormulaEngine>,
    resolver: Arc<dyn DeviceResolver>,
    state: Arc<Mutex<EngineState>>,
    queue_tx: Mutex<Option<mpsc::Sender<i64>>>,
}

impl FormulaEngine {
    pub fn new(device_name: impl Into<String>, resolver: Arc<dyn DeviceResolver>) -> Arc<Self> {
        let device_name = device_name.into();
        Arc::new_cyclic(|self_ref| Self {
            device_name,
            self_ref: self_ref.clone(),
            resolver,
            state: Arc::new(Mutex::new(EngineState::default())),
            queue_tx: Mutex::new(None),
        })
    }

    /// Load mappings targeting this device and arm the executor.
    ///
    /// Safe to call repeatedly (mapping CRUD events); previous
    /// subscriptions and locks are released first. Each armed mapping is
    /// evaluated once to initialize its target.
    pub fn reload(&self, rows: &[Mapping]) {
        self.shutdown();

        let mut state = self.state.lock().unwrap();
        let mut targets_taken: Vec<String> = Vec::new();

        for row in rows {
            if !row.enabled || row.device_name != self.device_name {
                continue;
            }
            let Some(target) = self
                .resolver
                .resolve_point(&row.device_name, &row.target_point_code)
            else {
                warn!(
                    device = %self.device_name,
                    target = %row.target_point_code,
                    "mapping target not found, skipping"
                );
                continue;
            };
            // A target may be claimed by at most one active mapping.
            if targets_taken.contains(&row.target_point_code) {
                warn!(
                    device = %self.device_name,
                    target = %row.target_point_code,
                    mapping = row.id,
                    "target already mapped, skipping"
                );
                continue;
            }
            let expr = match ast::parse(&row.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    // Disabled for the session; a later reload retries.
                    warn!(mapping = row.id, error = %e, "formula parse failed, mapping disabled");
                    continue;
                }
            };

            let mut resolved_sources = Vec::new();
            let mut all_sources_found = true;
            for source in &row.sources {
                match self
                    .resolver
                    .resolve_point(&source.device_name, &source.point_code)
                {
                    Some(point) => resolved_sources.push(point),
                    None => {
                        warn!(
                            mapping = row.id,
                            source = %source.point_code,
                            device = %source.device_name,
                            "mapping source not found"
                        );
                        all_sources_found = false;
                    }
                }
            }
            if !all_sources_found {
                continue;
            }

            target.set_locked_by_mapping(true);
            targets_taken.push(row.target_point_code.clone());

            for point in resolved_sources {
                state
                    .sender_map
                    .entry(point.id())
                    .or_default()
                    .push(row.id);
                point.set_send_signal(true);
            }

            state.mappings.insert(
                row.id,
                ActiveMapping {
                    row: row.clone(),
                    expr,
                },
            );
        }

        // Subscribe once per distinct source point.
        let (queue_tx, queue_rx) = mpsc::channel::<i64>(FORMULA_QUEUE_DEPTH);
        let source_ids: Vec<PointId> = state.sender_map.keys().copied().collect();
        for point_id in source_ids {
            let Some(point) = state
                .mappings
                .values()
                .flat_map(|m| m.row.sources.iter())
                .find_map(|s| {
                    self.resolver
                        .resolve_point(&s.device_name, &s.point_code)
                        .filter(|p| p.id() == point_id)
                })
            else {
                continue;
            };

            let subscriber_id = next_subscriber_id();
            let engine_state = self.state.clone();
            let tx = queue_tx.clone();
            point.on_change().connect(
                subscriber_id,
                Arc::new(move |event| {
                    let mapping_ids = {
                        let state = engine_state.lock().unwrap();
                        state
                            .sender_map
                            .get(&event.point.id())
                            .cloned()
                            .unwrap_or_default()
                    };
                    for mapping_id in mapping_ids {
                        // Bounded queue: a full executor sheds the tick.
                        if tx.try_send(mapping_id).is_err() {
                            debug!(mapping = mapping_id, "formula queue full, tick dropped");
                        }
                    }
                }),
            );
            state.subscriptions.push((point, subscriber_id));
        }

        let armed: Vec<i64> = state.mappings.keys().copied().collect();
        let count = armed.len();
        drop(state);

        *self.queue_tx.lock().unwrap() = Some(queue_tx.clone());
        self.spawn_worker(queue_rx);

        // Initialize every target.
        for mapping_id in armed {
            let _ = queue_tx.try_send(mapping_id);
        }
        info!(device = %self.device_name, mappings = count, "formula engine loaded");
    }

    /// Stop the executor without draining and release subscriptions.
    pub fn shutdown(&self) {
        *self.queue_tx.lock().unwrap() = None;
        let mut state = self.state.lock().unwrap();
        for (point, subscriber_id) in state.subscriptions.drain(..) {
            point.on_change().disconnect(subscriber_id);
        }
        for mapping in state.mappings.values() {
            if let Some(target) = self
                .resolver
                .resolve_point(&mapping.row.device_name, &mapping.row.target_point_code)
            {
                target.set_locked_by_mapping(false);
            }
        }
        state.mappings.clear();
        state.sender_map.clear();
    }

    /// Number of armed mappings.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    fn spawn_worker(&self, mut queue_rx: mpsc::Receiver<i64>) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            // Single worker: evaluations run in FIFO order and never
            // interleave with themselves.
            while let Some(mapping_id) = queue_rx.recv().await {
                engine.evaluate(mapping_id).await;
            }
        });
    }

    async fn evaluate(&self, mapping_id: i64) {
        let (row, expr) = {
            let state = self.state.lock().unwrap();
            let Some(mapping) = state.mappings.get(&mapping_id) else {
                return;
            };
            (mapping.row.clone(), mapping.expr.clone())
        };

        let mut ctx = HashMap::with_capacity(row.sources.len());
        for source in &row.sources {
            let value = self
                .resolver
                .resolve_point(&source.device_name, &source.point_code)
                .map(|p| {
                    if p.kind().is_scaled() {
                        p.real_value()
                    } else {
                        p.raw_value() as f64
                    }
                })
                .unwrap_or(0.0);
            ctx.insert(source.alias.clone(), value);
        }

        let result = match expr.eval(&ctx) {
            Ok(value) => value,
            Err(e) => {
                // Eval failure skips the tick; the mapping stays armed.
                debug!(mapping = mapping_id, error = %e, "formula evaluation skipped");
                return;
            }
        };

        let Some(target) = self
            .resolver
            .resolve_point(&row.device_name, &row.target_point_code)
        else {
            return;
        };
        let current = if target.kind().is_scaled() {
            target.real_value()
        } else {
            target.raw_value() as f64
        };
        // Loop breaker: identical results are not rewritten.
        if (result - current).abs() < 1e-6 {
            return;
        }

        let written = self
            .resolver
            .write_point_value(&row.device_name, &row.target_point_code, result)
            .await;
        if !written {
            debug!(
                mapping = mapping_id,
                target = %row.target_point_code,
                value = result,
                "formula write-back refused"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;
    use crate::core::store::PointStore;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Resolver over plain stores; writes go straight to the point.
    struct StoreResolver {
        stores: HashMap<String, Arc<PointStore>>,
    }

    #[async_trait]
    impl DeviceResolver for StoreResolver {
        fn resolve_point(&self, device_name: &str, point_code: &str) -> Option<Arc<Point>> {
            self.stores.get(device_name)?.get(point_code)
        }

        async fn write_point_value(
            &self,
            device_name: &str,
            point_code: &str,
            value: f64,
        ) -> bool {
            match self.resolve_point(device_name, point_code) {
                Some(point) => point.set_real_value(value),
                None => false,
            }
        }
    }

    fn analog(code: &str) -> Arc<Point> {
        Point::builder(PointKind::Analog, code, 1, 0, 3)
            .decode_code(0x41)
            .scaling(1.0, 0.0)
            .build()
    }

    fn two_device_setup() -> (Arc<StoreResolver>, Arc<Point>, Arc<Point>, Arc<Point>) {
        let dev_a = Arc::new(PointStore::new());
        let dev_b = Arc::new(PointStore::new());
        let p1 = analog("P1");
        let p2 = analog("P2");
        let target = analog("T");
        dev_a.add_point(p1.clone()).unwrap();
        dev_b.add_point(p2.clone()).unwrap();
        dev_a.add_point(target.clone()).unwrap();

        let resolver = Arc::new(StoreResolver {
            stores: HashMap::from([("devA".to_string(), dev_a), ("devB".to_string(), dev_b)]),
        });
        (resolver, p1, p2, target)
    }

    fn mapping(id: i64, expression: &str) -> Mapping {
        Mapping {
            id,
            device_name: "devA".to_string(),
            target_point_code: "T".to_string(),
            sources: vec![
                MappingSource {
                    device_name: "devA".to_string(),
                    point_code: "P1".to_string(),
                    alias: "a".to_string(),
                },
                MappingSource {
                    device_name: "devB".to_string(),
                    point_code: "P2".to_string(),
                    alias: "b".to_string(),
                },
            ],
            expression: expression.to_string(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_reload_initializes_target() {
        let (resolver, p1, p2, target) = two_device_setup();
        p1.set_real_value(10.0);
        p2.set_real_value(3.0);

        let engine = FormulaEngine::new("devA", resolver);
        engine.reload(&[mapping(1, "a+b*2")]);
        sleep(Duration::from_millis(100)).await;

        assert_eq!(target.real_value(), 16.0);
        assert!(target.is_locked_by_mapping());
    }

    #[tokio::test]
    async fn test_source_change_recomputes() {
        let (resolver, p1, p2, target) = two_device_setup();
        p1.set_real_value(10.0);
        p2.set_real_value(3.0);

        let engine = FormulaEngine::new("devA", resolver);
        engine.reload(&[mapping(1, "a+b*2")]);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(target.real_value(), 16.0);

        p2.set_real_value(5.0);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(target.real_value(), 20.0);
    }

    #[tokio::test]
    async fn test_unchanged_result_is_not_rewritten() {
        let (resolver, p1, p2, target) = two_device_setup();
        p1.set_real_value(10.0);
        p2.set_real_value(3.0);

        let engine = FormulaEngine::new("devA", resolver.clone());
        engine.reload(&[mapping(1, "a+b*2")]);
        sleep(Duration::from_millis(100)).await;

        // Track writes into the target from here on.
        use std::sync::atomic::{AtomicUsize, Ordering};
        let writes = Arc::new(AtomicUsize::new(0));
        {
            let writes = writes.clone();
            target.set_send_signal(true);
            target.on_change().connect(
                next_subscriber_id(),
                Arc::new(move |_| {
                    writes.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        // Re-assigning the same source value does not re-fire the write.
        p2.set_real_value(3.0);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parse_error_disables_mapping() {
        let (resolver, _, _, target) = two_device_setup();
        let engine = FormulaEngine::new("devA", resolver);
        engine.reload(&[mapping(1, "a +* b")]);
        sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.mapping_count(), 0);
        assert!(!target.is_locked_by_mapping());
    }

    #[tokio::test]
    async fn test_duplicate_target_keeps_first() {
        let (resolver, _, _, _) = two_device_setup();
        let engine = FormulaEngine::new("devA", resolver);
        engine.reload(&[mapping(1, "a+b"), mapping(2, "a-b")]);
        assert_eq!(engine.mapping_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_locks() {
        let (resolver, _, _, target) = two_device_setup();
        let engine = FormulaEngine::new("devA", resolver);
        engine.reload(&[mapping(1, "a+b")]);
        assert!(target.is_locked_by_mapping());
        engine.shutdown();
        assert!(!target.is_locked_by_mapping());
        assert_eq!(engine.mapping_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_blocks_mapping() {
        // Sources resolve at load time; a missing one blocks the mapping.
        let (resolver, _, _, _) = two_device_setup();
        let engine = FormulaEngine::new("devA", resolver);
        let mut row = mapping(1, "a+b+c");
        row.sources.push(MappingSource {
            device_name: "devC".to_string(),
            point_code: "nope".to_string(),
            alias: "c".to_string(),
        });
        engine.reload(&[row]);
        assert_eq!(engine.mapping_count(), 0);
    }
}
