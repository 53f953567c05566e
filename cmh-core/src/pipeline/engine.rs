// cmh-core/src/pipeline/engine.rs
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use cmh_common::error::{CmhError, Result};
use cmh_common::{DependencyGraph, ResolvedModule};
use futures::future::join_all;
use semver::Version;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, instrument, warn};

use super::event::PipelineEvent;
use crate::cache::CacheManager;

#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub name: String,
    pub version: Version,
    pub result: Result<PathBuf>,
}

/// Per-module results of materializing a whole graph, in topological order.
#[derive(Debug, Clone, Default)]
pub struct GraphMaterialization {
    pub outcomes: Vec<ModuleOutcome>,
}

impl GraphMaterialization {
    pub fn get(&self, name: &str) -> Option<&Result<PathBuf>> {
        self.outcomes
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.result)
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Artifact directories of the modules that succeeded.
    pub fn paths(&self) -> BTreeMap<&str, &PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|p| (o.name.as_str(), p)))
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CmhError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }
}

/// Materializes every module of `graph`, dependencies first.
///
/// Modules of one dependency level run concurrently, at most `max_parallel`
/// at a time. A failure only affects its own module and the modules that
/// depend on it (reported as `DependencyFailed`); unrelated modules still
/// complete.
pub async fn materialize_graph(
    cache: &CacheManager,
    graph: &DependencyGraph,
    max_parallel: usize,
) -> GraphMaterialization {
    materialize_graph_with_events(cache, graph, max_parallel, None).await
}

#[instrument(skip_all, name = "materialize_graph", fields(modules = graph.len()))]
pub async fn materialize_graph_with_events(
    cache: &CacheManager,
    graph: &DependencyGraph,
    max_parallel: usize,
    event_tx: Option<&broadcast::Sender<PipelineEvent>>,
) -> GraphMaterialization {
    let started = Instant::now();
    let send = |event: PipelineEvent| {
        if let Some(tx) = event_tx {
            let _ = tx.send(event);
        }
    };
    send(PipelineEvent::PipelineStarted {
        total_modules: graph.len(),
    });

    let semaphore = Semaphore::new(max_parallel.max(1));
    let mut results: HashMap<String, Result<PathBuf>> = HashMap::with_capacity(graph.len());

    for (level, modules) in graph.levels().into_iter().enumerate() {
        debug!(
            "Materializing level {} with {} modules",
            level,
            modules.len()
        );
        send(PipelineEvent::LevelStarted {
            level,
            modules: modules.iter().map(|m| m.name.clone()).collect(),
        });

        let mut runnable: Vec<&ResolvedModule> = Vec::with_capacity(modules.len());
        for module in modules {
            let failed_dependency = module
                .dependencies
                .iter()
                .find(|d| results.get(d.as_str()).is_some_and(|r| r.is_err()));
            match failed_dependency {
                Some(dependency) => {
                    warn!(
                        "Skipping '{}' because dependency '{}' failed",
                        module.name, dependency
                    );
                    let err = CmhError::DependencyFailed {
                        module: module.name.clone(),
                        dependency: dependency.clone(),
                    };
                    send(PipelineEvent::module_failed(&module.name, &err));
                    results.insert(module.name.clone(), Err(err));
                }
                None => runnable.push(module),
            }
        }

        let level_results = join_all(runnable.into_iter().map(|module| {
            let semaphore = &semaphore;
            let send = &send;
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => {
                        send(PipelineEvent::ModuleStarted {
                            name: module.name.clone(),
                            version: module.version.to_string(),
                        });
                        cache.materialize(module).await
                    }
                    Err(e) => Err(CmhError::Generic(format!("worker limit closed: {e}"))),
                };
                match &result {
                    Ok(path) => send(PipelineEvent::ModuleMaterialized {
                        name: module.name.clone(),
                        path: path.clone(),
                    }),
                    Err(err) => send(PipelineEvent::module_failed(&module.name, err)),
                }
                (module.name.clone(), result)
            }
        }))
        .await;
        results.extend(level_results);
    }

    let outcomes: Vec<ModuleOutcome> = graph
        .topological_order()
        .map(|module| ModuleOutcome {
            name: module.name.clone(),
            version: module.version.clone(),
            result: results.remove(&module.name).unwrap_or_else(|| {
                Err(CmhError::Generic(format!(
                    "module '{}' was never scheduled",
                    module.name
                )))
            }),
        })
        .collect();
    let report = GraphMaterialization { outcomes };

    debug!(
        "Graph materialization finished: {} succeeded, {} failed",
        report.success_count(),
        report.fail_count()
    );
    send(PipelineEvent::PipelineFinished {
        duration_secs: started.elapsed().as_secs_f64(),
        success_count: report.success_count(),
        fail_count: report.fail_count(),
    });
    report
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use cmh_common::config::Config;
    use cmh_common::dependency::GraphBuilder;
    use cmh_common::ModuleDescriptor;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    use super::*;
    use crate::cache::Materializer;

    /// Fails for the modules named in `broken`, records the order of calls.
    struct ScriptedMaterializer {
        broken: Vec<String>,
        calls: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedMaterializer {
        fn new(broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Materializer for ScriptedMaterializer {
        fn materialize<'a>(
            &'a self,
            module: &'a ResolvedModule,
            destination: &'a Path,
        ) -> BoxFuture<'a, Result<()>> {
            async move {
                self.calls.lock().unwrap().push(module.name.clone());
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                if self.broken.contains(&module.name) {
                    return Err(CmhError::Generic(format!("{} is broken", module.name)));
                }
                std::fs::write(destination.join("module.cmake"), &module.name)?;
                Ok(())
            }
            .boxed()
        }
    }

    fn node(name: &str, deps: &[&str]) -> ResolvedModule {
        let descriptor = Arc::new(ModuleDescriptor::new(name, vec![Version::new(1, 0, 0)]));
        deps.iter().fold(
            ResolvedModule::new(descriptor, Version::new(1, 0, 0)),
            |m, d| m.with_dependency(*d),
        )
    }

    fn diamond() -> DependencyGraph {
        GraphBuilder::build(vec![
            node("app", &["left", "right"]),
            node("left", &["base"]),
            node("right", &["base"]),
            node("base", &[]),
            node("tool", &[]),
        ])
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dependencies_are_materialized_first() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = Arc::new(ScriptedMaterializer::new(&[]));
        let cache = CacheManager::open(&Config::with_root(tmp.path()), materializer.clone()).unwrap();

        let (tx, mut rx) = broadcast::channel(64);
        let report = materialize_graph_with_events(&cache, &diamond(), 4, Some(&tx)).await;
        assert!(report.is_success());
        assert_eq!(report.success_count(), 5);

        let calls = materializer.calls.lock().unwrap().clone();
        let pos = |n: &str| calls.iter().position(|c| c == n).unwrap();
        assert!(pos("base") < pos("left"));
        assert!(pos("base") < pos("right"));
        assert!(pos("left") < pos("app"));
        assert!(pos("right") < pos("app"));

        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::PipelineFinished { success_count, fail_count, .. } = event {
                assert_eq!((success_count, fail_count), (5, 0));
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_is_scoped_to_dependents() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = Arc::new(ScriptedMaterializer::new(&["left"]));
        let cache = CacheManager::open(&Config::with_root(tmp.path()), materializer.clone()).unwrap();

        let report = materialize_graph(&cache, &diamond(), 4).await;
        assert_eq!(report.fail_count(), 2);
        assert!(matches!(report.get("left"), Some(Err(CmhError::Materialization { .. }))));
        assert!(matches!(
            report.get("app"),
            Some(Err(CmhError::DependencyFailed { dependency, .. })) if dependency == "left"
        ));
        assert!(report.get("right").unwrap().is_ok());
        assert!(report.get("tool").unwrap().is_ok());
        assert!(!materializer.calls.lock().unwrap().contains(&"app".to_string()));
        assert_eq!(report.paths().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallelism_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = Arc::new(ScriptedMaterializer::new(&[]));
        let cache = CacheManager::open(&Config::with_root(tmp.path()), materializer.clone()).unwrap();
        let graph = GraphBuilder::build((0..8).map(|i| node(&format!("m{i}"), &[])).collect()).unwrap();

        let report = materialize_graph(&cache, &graph, 2).await;
        assert!(report.is_success());
        assert!(materializer.peak.load(Ordering::SeqCst) <= 2);
    }
}
