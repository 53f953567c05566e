// cmh-common/src/dependency/resolver.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, error};

use super::graph::{DependencyGraph, GraphBuilder, ResolvedModule};
use super::requirement::{ConstraintOrigin, Requester, RootRequest};
use crate::config::Config;
use crate::error::{CmhError, Result};
use crate::model::{ModuleDescriptor, ParameterValue, VersionConstraint};
use crate::registry::ModuleRegistry;

/// How parameter values from different root requests are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterPrecedence {
    /// A later root request overrides an earlier one.
    #[default]
    LaterWins,
    /// Any disagreement between root requests is a conflict.
    Strict,
}

impl FromStr for ParameterPrecedence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "later-wins" | "later" | "last" => Ok(Self::LaterWins),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown parameter precedence '{other}' (expected 'later-wins' or 'strict')")),
        }
    }
}

impl fmt::Display for ParameterPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaterWins => write!(f, "later-wins"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Deepest dependency level (roots are level 0) that may be expanded.
    pub max_depth: usize,
    pub parameter_precedence: ParameterPrecedence,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_depth: 64,
            parameter_precedence: ParameterPrecedence::default(),
        }
    }
}

impl ResolveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.max_resolution_depth,
            parameter_precedence: config.parameter_precedence,
        }
    }
}

/// Computes one consistent version per module for a set of root requests.
///
/// The resolver itself only borrows the registry; every call to
/// [`Resolver::resolve`] owns its traversal state, so one resolver can serve
/// concurrent callers.
pub struct Resolver<'a> {
    registry: &'a ModuleRegistry,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ModuleRegistry, options: ResolveOptions) -> Self {
        Self { registry, options }
    }

    pub fn resolve(&self, roots: &[RootRequest]) -> Result<DependencyGraph> {
        debug!(
            "Starting resolution for roots: {:?}",
            roots
                .iter()
                .map(|r| format!("{} {}", r.name, r.constraint))
                .collect::<Vec<_>>()
        );

        let mut run = ResolutionRun::new(self.registry, &self.options);
        for (index, root) in roots.iter().enumerate() {
            let requester = Requester::Root(index);
            run.require(&root.name, &root.constraint, requester.clone(), 0)?;
            run.apply_parameters(&root.name, &requester, &root.parameters, Layer::Root)?;
        }
        run.expand()?;
        run.check_declared_conflicts()?;

        let modules = run.into_resolved_modules();
        debug!(
            "Resolution reached a fixed point: {:?}",
            modules.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        GraphBuilder::build(modules)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Root,
    Edge,
}

#[derive(Debug)]
struct ModuleState {
    descriptor: Arc<ModuleDescriptor>,
    constraint: VersionConstraint,
    origins: Vec<ConstraintOrigin>,
    selected: Version,
    depth: usize,
    root_parameters: BTreeMap<String, (Requester, ParameterValue)>,
    edge_parameters: BTreeMap<String, (Requester, ParameterValue)>,
    dependencies: BTreeSet<String>,
}

/// Traversal state of a single `resolve` call.
struct ResolutionRun<'r> {
    registry: &'r ModuleRegistry,
    options: &'r ResolveOptions,
    states: HashMap<String, ModuleState>,
    /// First-encounter order, which keeps the output deterministic.
    discovered: Vec<String>,
    queue: VecDeque<String>,
}

impl<'r> ResolutionRun<'r> {
    fn new(registry: &'r ModuleRegistry, options: &'r ResolveOptions) -> Self {
        Self {
            registry,
            options,
            states: HashMap::new(),
            discovered: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Records a constraint on `name`, selecting or re-selecting its version.
    fn require(
        &mut self,
        name: &str,
        constraint: &VersionConstraint,
        requester: Requester,
        depth: usize,
    ) -> Result<()> {
        let origin = ConstraintOrigin {
            requester,
            constraint: constraint.clone(),
        };

        if let Some(state) = self.states.get_mut(name) {
            state.origins.push(origin);
            state.depth = state.depth.min(depth);

            let Some(combined) = state.constraint.intersect(constraint) else {
                error!("Constraints on '{}' have an empty intersection.", name);
                return Err(version_conflict(name, state));
            };
            state.constraint = combined;
            if !state.constraint.satisfies(&state.selected) {
                let Some(reselected) = state.constraint.select_highest(&state.descriptor.versions)
                else {
                    error!(
                        "No version of '{}' satisfies {}.",
                        name, state.constraint
                    );
                    return Err(version_conflict(name, state));
                };
                debug!(
                    "Re-selected '{}' from {} to {} under {}",
                    name, state.selected, reselected, state.constraint
                );
                state.selected = reselected.clone();
            }
            return Ok(());
        }

        if depth > self.options.max_depth {
            error!("Resolution depth limit hit at '{}' (depth {}).", name, depth);
            return Err(CmhError::ResolutionDepthExceeded {
                module: name.to_string(),
                depth,
                limit: self.options.max_depth,
            });
        }

        let Some(descriptor) = self.registry.get(name).cloned() else {
            error!("Module '{}' requested by {} is not in the registry.", name, origin.requester);
            return Err(CmhError::ModuleNotFound {
                name: name.to_string(),
                requesters: vec![origin.requester],
            });
        };

        let Some(selected) = constraint.select_highest(&descriptor.versions).cloned() else {
            error!("No version of '{}' satisfies {}.", name, constraint);
            return Err(CmhError::VersionConflict {
                module: name.to_string(),
                requesters: vec![origin],
                available: descriptor.versions.clone(),
            });
        };
        debug!("Selected '{}' {} for {} at depth {}", name, selected, origin, depth);

        self.states.insert(
            name.to_string(),
            ModuleState {
                descriptor,
                constraint: constraint.clone(),
                origins: vec![origin],
                selected,
                depth,
                root_parameters: BTreeMap::new(),
                edge_parameters: BTreeMap::new(),
                dependencies: BTreeSet::new(),
            },
        );
        self.discovered.push(name.to_string());
        self.queue.push_back(name.to_string());
        Ok(())
    }

    /// Validates and merges explicit parameter values for `name`.
    fn apply_parameters(
        &mut self,
        name: &str,
        requester: &Requester,
        parameters: &BTreeMap<String, ParameterValue>,
        layer: Layer,
    ) -> Result<()> {
        let precedence = self.options.parameter_precedence;
        let Some(state) = self.states.get_mut(name) else {
            return Ok(());
        };

        for (key, value) in parameters {
            let Some(spec) = state.descriptor.parameters.get(key) else {
                return Err(CmhError::InvalidParameter {
                    module: name.to_string(),
                    parameter: key.clone(),
                    reason: format!("unknown parameter (requested by {requester})"),
                });
            };
            spec.validate(value).map_err(|reason| CmhError::InvalidParameter {
                module: name.to_string(),
                parameter: key.clone(),
                reason,
            })?;

            let conflict = |(first, first_value): &(Requester, ParameterValue)| {
                CmhError::ParameterConflict {
                    module: name.to_string(),
                    parameter: key.clone(),
                    first: first.clone(),
                    first_value: first_value.clone(),
                    second: requester.clone(),
                    second_value: value.clone(),
                }
            };

            match layer {
                Layer::Root => {
                    if let Some(existing) = state.root_parameters.get(key) {
                        if existing.1 != *value {
                            if precedence == ParameterPrecedence::Strict {
                                return Err(conflict(existing));
                            }
                            debug!(
                                "Parameter '{}' of '{}': {} from {} overrides {} from {}",
                                key, name, value, requester, existing.1, existing.0
                            );
                        }
                    }
                    state
                        .root_parameters
                        .insert(key.clone(), (requester.clone(), value.clone()));
                }
                Layer::Edge => {
                    if let Some(existing) = state.root_parameters.get(key) {
                        if existing.1 != *value {
                            return Err(conflict(existing));
                        }
                    }
                    if let Some(existing) = state.edge_parameters.get(key) {
                        if existing.1 != *value {
                            return Err(conflict(existing));
                        }
                    } else {
                        state
                            .edge_parameters
                            .insert(key.clone(), (requester.clone(), value.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Breadth-first expansion until no new modules are discovered.
    fn expand(&mut self) -> Result<()> {
        while let Some(name) = self.queue.pop_front() {
            let Some(state) = self.states.get(&name) else {
                continue;
            };
            let descriptor = Arc::clone(&state.descriptor);
            let depth = state.depth;
            let requester = Requester::Module(name.clone());
            debug!("Expanding '{}' ({} dependencies)", name, descriptor.dependencies.len());

            for dependency in &descriptor.dependencies {
                self.require(&dependency.name, &dependency.constraint, requester.clone(), depth + 1)?;
                self.apply_parameters(&dependency.name, &requester, &dependency.parameters, Layer::Edge)?;
                if let Some(state) = self.states.get_mut(&name) {
                    state.dependencies.insert(dependency.name.clone());
                }
            }
        }
        Ok(())
    }

    fn check_declared_conflicts(&self) -> Result<()> {
        for name in &self.discovered {
            let Some(state) = self.states.get(name) else {
                continue;
            };
            if let Some(other) = state
                .descriptor
                .conflicts
                .iter()
                .find(|c| self.states.contains_key(c.as_str()))
            {
                error!("Module '{}' conflicts with '{}'.", name, other);
                return Err(CmhError::ModuleConflict {
                    module: name.clone(),
                    conflicts_with: other.clone(),
                });
            }
        }
        Ok(())
    }

    fn into_resolved_modules(mut self) -> Vec<ResolvedModule> {
        let mut modules = Vec::with_capacity(self.discovered.len());
        for name in &self.discovered {
            let Some(state) = self.states.remove(name) else {
                continue;
            };
            let mut parameters: BTreeMap<String, ParameterValue> = state
                .descriptor
                .parameters
                .iter()
                .filter_map(|(key, spec)| spec.default.clone().map(|d| (key.clone(), d)))
                .collect();
            for (key, (_, value)) in state.edge_parameters.into_iter().chain(state.root_parameters) {
                parameters.insert(key, value);
            }

            modules.push(ResolvedModule {
                name: name.clone(),
                version: state.selected,
                parameters,
                dependencies: state.dependencies,
                descriptor: state.descriptor,
            });
        }
        modules
    }
}

fn version_conflict(name: &str, state: &ModuleState) -> CmhError {
    CmhError::VersionConflict {
        module: name.to_string(),
        requesters: state.origins.clone(),
        available: state.descriptor.versions.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencySpec;
    use crate::model::{parse_version, ParameterKind, ParameterSpec};

    fn c(expr: &str) -> VersionConstraint {
        expr.parse().unwrap()
    }

    fn module(name: &str, versions: &[&str]) -> ModuleDescriptor {
        ModuleDescriptor::new(name, versions.iter().map(|v| parse_version(v).unwrap()).collect())
    }

    fn dep(name: &str, constraint: &str) -> DependencySpec {
        DependencySpec::new(name, c(constraint))
    }

    fn bool_param(default: bool) -> ParameterSpec {
        ParameterSpec {
            kind: ParameterKind::Bool,
            default: Some(default.into()),
            allowed: Vec::new(),
            description: None,
        }
    }

    fn resolve(registry: &ModuleRegistry, roots: &[RootRequest]) -> Result<DependencyGraph> {
        Resolver::new(registry, ResolveOptions::default()).resolve(roots)
    }

    #[test]
    fn selects_newest_compatible_version() {
        let registry = ModuleRegistry::from_descriptors([module("X", &["1.0", "1.2", "1.5", "2.0"])]);
        let graph = resolve(&registry, &[RootRequest::new("X", c(">=1.0,<2.0"))]).unwrap();
        assert_eq!(graph.get("X").unwrap().version, Version::new(1, 5, 0));
    }

    #[test]
    fn transitive_constraints_are_all_satisfied() {
        let registry = ModuleRegistry::from_descriptors([
            module("app", &["1.0"])
                .with_dependency(dep("spdlog", ">=1.10"))
                .with_dependency(dep("fmt", ">=9")),
            module("spdlog", &["1.9", "1.11", "1.12"]).with_dependency(dep("fmt", "<11")),
            module("fmt", &["8.1", "9.1", "10.2", "11.0"]),
        ]);
        let graph = resolve(&registry, &[RootRequest::latest("app")]).unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get("spdlog").unwrap().version, Version::new(1, 12, 0));
        assert_eq!(graph.get("fmt").unwrap().version, Version::new(10, 2, 0));
        let order: Vec<&str> = graph.topological_order().map(|m| m.name.as_str()).collect();
        assert_eq!(order.first(), Some(&"fmt"));
        assert_eq!(order.last(), Some(&"app"));
    }

    #[test]
    fn later_requirement_reselects_lower_version() {
        let registry = ModuleRegistry::from_descriptors([
            module("a", &["1.0"]).with_dependency(dep("x", ">=1.0")),
            module("b", &["1.0"]).with_dependency(dep("x", "<2.0")),
            module("x", &["1.0", "1.5", "2.0"]),
        ]);
        let graph = resolve(&registry, &[RootRequest::latest("a"), RootRequest::latest("b")]).unwrap();
        assert_eq!(graph.get("x").unwrap().version, Version::new(1, 5, 0));
    }

    #[test]
    fn disjoint_constraints_fail_naming_the_module() {
        let registry = ModuleRegistry::from_descriptors([module("X", &["1.0", "2.0"])]);
        let err = resolve(
            &registry,
            &[RootRequest::new("X", c(">=2.0")), RootRequest::new("X", c("<2.0"))],
        )
        .unwrap_err();

        match &err {
            CmhError::VersionConflict { module, requesters, .. } => {
                assert_eq!(module, "X");
                assert_eq!(requesters.len(), 2);
                assert_eq!(requesters[0].requester, Requester::Root(0));
                assert_eq!(requesters[1].requester, Requester::Root(1));
            }
            other => panic!("expected a version conflict, got {other:?}"),
        }
        assert!(err.to_string().contains("'X'"));
    }

    #[test]
    fn unsatisfiable_intersection_against_registry_fails() {
        let registry = ModuleRegistry::from_descriptors([
            module("a", &["1.0"]).with_dependency(dep("x", ">=1.1")),
            module("x", &["1.0", "2.0"]),
        ]);
        let err = resolve(
            &registry,
            &[RootRequest::latest("a"), RootRequest::new("x", c("<2.0"))],
        )
        .unwrap_err();
        assert!(matches!(err, CmhError::VersionConflict { ref module, .. } if module == "x"));
    }

    #[test]
    fn unknown_module_names_its_requester() {
        let registry = ModuleRegistry::from_descriptors([
            module("app", &["1.0"]).with_dependency(dep("ghost", "*")),
        ]);
        let err = resolve(&registry, &[RootRequest::latest("app")]).unwrap_err();
        match err {
            CmhError::ModuleNotFound { name, requesters } => {
                assert_eq!(name, "ghost");
                assert_eq!(requesters, vec![Requester::Module("app".into())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_are_overridden_by_explicit_values() {
        let registry = ModuleRegistry::from_descriptors([module("sanitizers", &["1.0"])
            .with_parameter("ASAN", bool_param(false))
            .with_parameter("UBSAN", bool_param(false))]);
        let graph = resolve(
            &registry,
            &[RootRequest::latest("sanitizers").with_parameter("ASAN", true)],
        )
        .unwrap();
        let params = &graph.get("sanitizers").unwrap().parameters;
        assert_eq!(params["ASAN"], ParameterValue::Bool(true));
        assert_eq!(params["UBSAN"], ParameterValue::Bool(false));
    }

    #[test]
    fn later_root_request_wins_by_default() {
        let registry = ModuleRegistry::from_descriptors([
            module("sanitizers", &["1.0"]).with_parameter("ASAN", bool_param(false)),
        ]);
        let roots = [
            RootRequest::latest("sanitizers").with_parameter("ASAN", true),
            RootRequest::latest("sanitizers").with_parameter("ASAN", false),
        ];
        let graph = resolve(&registry, &roots).unwrap();
        assert_eq!(graph.get("sanitizers").unwrap().parameters["ASAN"], ParameterValue::Bool(false));

        let strict = ResolveOptions {
            parameter_precedence: ParameterPrecedence::Strict,
            ..ResolveOptions::default()
        };
        let err = Resolver::new(&registry, strict).resolve(&roots).unwrap_err();
        assert!(matches!(err, CmhError::ParameterConflict { ref parameter, .. } if parameter == "ASAN"));
    }

    #[test]
    fn dependents_disagreeing_on_a_parameter_conflict() {
        let registry = ModuleRegistry::from_descriptors([
            module("a", &["1.0"]).with_dependency(dep("fmt", "*").with_parameter("HEADER_ONLY", true)),
            module("b", &["1.0"]).with_dependency(dep("fmt", "*").with_parameter("HEADER_ONLY", false)),
            module("fmt", &["10.0"]).with_parameter("HEADER_ONLY", bool_param(false)),
        ]);
        let err = resolve(&registry, &[RootRequest::latest("a"), RootRequest::latest("b")]).unwrap_err();
        match err {
            CmhError::ParameterConflict { module, first, second, .. } => {
                assert_eq!(module, "fmt");
                assert_eq!(first, Requester::Module("a".into()));
                assert_eq!(second, Requester::Module("b".into()));
            }
            other => panic!("unexpected {other:?}"),
        }

        // A dependent contradicting the root request is a conflict too.
        let err = resolve(
            &registry,
            &[
                RootRequest::latest("fmt").with_parameter("HEADER_ONLY", false),
                RootRequest::latest("a"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CmhError::ParameterConflict { .. }));
    }

    #[test]
    fn unknown_or_mistyped_parameters_are_rejected() {
        let registry = ModuleRegistry::from_descriptors([
            module("fmt", &["10.0"]).with_parameter("HEADER_ONLY", bool_param(false)),
        ]);
        let err = resolve(&registry, &[RootRequest::latest("fmt").with_parameter("NOPE", true)]).unwrap_err();
        assert!(matches!(err, CmhError::InvalidParameter { .. }));
        let err =
            resolve(&registry, &[RootRequest::latest("fmt").with_parameter("HEADER_ONLY", "yes")]).unwrap_err();
        assert!(matches!(err, CmhError::InvalidParameter { .. }));
    }

    #[test]
    fn deep_chains_hit_the_depth_limit() {
        let registry = ModuleRegistry::from_descriptors((0..6).map(|i| {
            let m = module(&format!("m{i}"), &["1.0"]);
            if i < 5 {
                m.with_dependency(dep(&format!("m{}", i + 1), "*"))
            } else {
                m
            }
        }));
        let options = ResolveOptions {
            max_depth: 3,
            ..ResolveOptions::default()
        };
        let err = Resolver::new(&registry, options)
            .resolve(&[RootRequest::latest("m0")])
            .unwrap_err();
        assert!(matches!(
            err,
            CmhError::ResolutionDepthExceeded { ref module, depth: 4, limit: 3 } if module == "m4"
        ));
    }

    #[test]
    fn long_paths_within_the_depth_limit_resolve() {
        const N: usize = 10_000;
        let root = (0..N).fold(module("root", &["1.0"]), |m, i| {
            m.with_dependency(dep(&format!("m{i}"), "*"))
        });
        let chain = (0..N).map(|i| {
            let m = module(&format!("m{i}"), &["1.0"]);
            if i + 1 < N {
                m.with_dependency(dep(&format!("m{}", i + 1), "*"))
            } else {
                m
            }
        });
        let registry = ModuleRegistry::from_descriptors(std::iter::once(root).chain(chain));

        let graph = resolve(&registry, &[RootRequest::latest("root")]).unwrap();
        assert_eq!(graph.len(), N + 1);
        let order: Vec<&str> = graph.topological_order().map(|m| m.name.as_str()).collect();
        assert_eq!(order.first().copied(), Some(format!("m{}", N - 1).as_str()));
        assert_eq!(order.last().copied(), Some("root"));
    }

    #[test]
    fn declared_conflicts_abort_resolution() {
        let registry = ModuleRegistry::from_descriptors([
            module("gcov", &["1.0"]).with_conflict("llvm-cov"),
            module("llvm-cov", &["1.0"]),
        ]);
        let err = resolve(&registry, &[RootRequest::latest("gcov"), RootRequest::latest("llvm-cov")])
            .unwrap_err();
        assert!(matches!(err, CmhError::ModuleConflict { .. }));
    }

    #[test]
    fn cyclic_registry_data_is_reported_as_cycle() {
        let registry = ModuleRegistry::from_descriptors([
            module("A", &["1.0"]).with_dependency(dep("B", "*")),
            module("B", &["1.0"]).with_dependency(dep("C", "*")),
            module("C", &["1.0"]).with_dependency(dep("A", "*")),
        ]);
        let err = resolve(&registry, &[RootRequest::latest("A")]).unwrap_err();
        assert!(matches!(err, CmhError::Cycle { path } if path == vec!["A", "B", "C", "A"]));
    }

    #[test]
    fn resolution_is_deterministic() {
        let registry = ModuleRegistry::from_descriptors([
            module("app", &["1.0"])
                .with_dependency(dep("b", "*"))
                .with_dependency(dep("a", "*")),
            module("a", &["1.0", "1.1"]),
            module("b", &["2.0"]).with_dependency(dep("a", "<1.1")),
        ]);
        let first = resolve(&registry, &[RootRequest::latest("app")]).unwrap();
        let second = resolve(&registry, &[RootRequest::latest("app")]).unwrap();
        assert_eq!(first.nodes(), second.nodes());
        assert_eq!(first.get("a").unwrap().version, Version::new(1, 0, 0));
    }

    #[test]
    fn precedence_parses_from_text() {
        assert_eq!("strict".parse::<ParameterPrecedence>(), Ok(ParameterPrecedence::Strict));
        assert_eq!("Later-Wins".parse::<ParameterPrecedence>(), Ok(ParameterPrecedence::LaterWins));
        assert!("random".parse::<ParameterPrecedence>().is_err());
    }
}
