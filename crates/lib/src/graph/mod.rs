//! The generator dependency graph and closure engine.
//!
//! Given the full set of generators visible to the requested machines
//! (shared generators once, machine-scoped generators once per machine),
//! each annotated with an `exists` flag, this module computes which
//! generators must run and in what order.
//!
//! All four closure operations return a deterministic topological order:
//! Kahn's algorithm with a name-ordered ready set, so ties always break by
//! ascending key. Dependency edges are restricted to the closure set
//! before ordering — generators outside the closure never constrain it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, info};

use crate::generator::{Generator, GeneratorKey};

/// A graph node: a generator plus whether its outputs are already
/// materialized and valid in the stores.
#[derive(Debug, Clone)]
pub struct GeneratorNode {
  pub generator: Generator,
  /// True iff every declared var is present in its store and the stored
  /// validation record matches the generator's hash.
  pub exists: bool,
}

/// The dependency graph over all generators of one request.
#[derive(Debug)]
pub struct GeneratorGraph {
  /// Edges point from dependency to dependent.
  graph: DiGraph<GeneratorKey, ()>,
  indices: BTreeMap<GeneratorKey, NodeIndex>,
  nodes: BTreeMap<GeneratorKey, GeneratorNode>,
}

impl GeneratorGraph {
  /// Build and validate the graph.
  ///
  /// # Errors
  ///
  /// - `SharedDependsOnMachine` if a shared generator references a
  ///   machine-scoped one (its output would become machine-dependent)
  /// - `UnknownDependency` for dangling references
  /// - `Cycle` if the dependency relation is not acyclic
  pub fn new(nodes: BTreeMap<GeneratorKey, GeneratorNode>) -> Result<Self, ClosureError> {
    let mut graph = DiGraph::new();
    let mut indices = BTreeMap::new();

    for key in nodes.keys() {
      let idx = graph.add_node(key.clone());
      indices.insert(key.clone(), idx);
    }

    for (key, node) in &nodes {
      let dependent_idx = indices[key];
      for dep_ref in &node.generator.dependencies {
        if node.generator.share && !dep_ref.shared {
          return Err(ClosureError::SharedDependsOnMachine {
            generator: key.name.clone(),
            dependency: dep_ref.name.clone(),
          });
        }
        let dep_key = if dep_ref.shared {
          GeneratorKey::shared(&dep_ref.name)
        } else {
          // Non-shared refs resolve within the owning machine.
          GeneratorKey {
            machine: key.machine.clone(),
            name: dep_ref.name.clone(),
          }
        };
        let dep_idx =
          indices
            .get(&dep_key)
            .copied()
            .ok_or_else(|| ClosureError::UnknownDependency {
              generator: key.to_string(),
              dependency: dep_key.to_string(),
            })?;
        graph.add_edge(dep_idx, dependent_idx, ());
      }
    }

    let built = Self {
      graph,
      indices,
      nodes,
    };
    // Surface cycles at construction time rather than in every closure.
    let all: BTreeSet<GeneratorKey> = built.nodes.keys().cloned().collect();
    built.toposort_subset(&all)?;
    Ok(built)
  }

  pub fn contains(&self, key: &GeneratorKey) -> bool {
    self.nodes.contains_key(key)
  }

  pub fn generator(&self, key: &GeneratorKey) -> Option<&Generator> {
    self.nodes.get(key).map(|n| &n.generator)
  }

  pub fn exists(&self, key: &GeneratorKey) -> bool {
    self.nodes.get(key).is_some_and(|n| n.exists)
  }

  /// Resolved dependency keys of `key`, in ascending order.
  pub fn dependencies_of(&self, key: &GeneratorKey) -> Vec<GeneratorKey> {
    self.neighbors(key, Direction::Incoming)
  }

  /// Generators that directly depend on `key`, in ascending order.
  pub fn dependents_of(&self, key: &GeneratorKey) -> Vec<GeneratorKey> {
    self.neighbors(key, Direction::Outgoing)
  }

  fn neighbors(&self, key: &GeneratorKey, direction: Direction) -> Vec<GeneratorKey> {
    let Some(&idx) = self.indices.get(key) else {
      return Vec::new();
    };
    let mut keys: Vec<GeneratorKey> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    keys.sort();
    keys.dedup();
    keys
  }

  /// Every generator, in dependency order. "Regenerate everything."
  pub fn full_closure(&self) -> Result<Vec<GeneratorKey>, ClosureError> {
    let all: BTreeSet<GeneratorKey> = self.nodes.keys().cloned().collect();
    self.toposort_subset(&all)
  }

  /// Every missing generator plus all transitive dependents of a missing
  /// one, in dependency order. A plain "generate" with no explicit target:
  /// anything built on top of a gap may be stale and must re-run too.
  pub fn all_missing_closure(&self) -> Result<Vec<GeneratorKey>, ClosureError> {
    let missing: BTreeSet<GeneratorKey> = self
      .nodes
      .iter()
      .filter(|(_, node)| !node.exists)
      .map(|(key, _)| key.clone())
      .collect();
    let mut closure = missing.clone();
    closure.extend(self.dependent_closure(&missing));
    self.toposort_subset(&closure)
  }

  /// The requested generators, their transitively *missing* dependencies
  /// (existing dependencies are not pulled in), and all transitive
  /// dependents of that combined set. "Regenerate this generator."
  pub fn requested_closure(
    &self,
    requested: &[GeneratorKey],
  ) -> Result<Vec<GeneratorKey>, ClosureError> {
    self.validate_requested(requested)?;
    let mut closure: BTreeSet<GeneratorKey> = requested.iter().cloned().collect();
    closure.extend(self.missing_dependency_closure(requested));
    closure.extend(self.dependent_closure(&closure.clone()));
    self.toposort_subset(&closure)
  }

  /// Only what is needed for the requested generators' data to exist:
  /// transitively missing dependencies, plus the requested generators
  /// themselves iff they are missing. Dependents are not pulled in, and
  /// a fully satisfied request yields an empty list — this operation is
  /// idempotent.
  pub fn minimal_closure(
    &self,
    requested: &[GeneratorKey],
  ) -> Result<Vec<GeneratorKey>, ClosureError> {
    self.validate_requested(requested)?;
    let mut closure = self.missing_dependency_closure(requested);
    for key in requested {
      if self.exists(key) {
        info!(generator = %key, "already up to date, nothing to generate");
      } else {
        closure.insert(key.clone());
      }
    }
    self.toposort_subset(&closure)
  }

  fn validate_requested(&self, requested: &[GeneratorKey]) -> Result<(), ClosureError> {
    for key in requested {
      if !self.contains(key) {
        return Err(ClosureError::UnknownGenerator {
          generator: key.to_string(),
        });
      }
    }
    Ok(())
  }

  /// Transitively missing dependencies of the seed set (seeds excluded).
  /// Recursion only continues through missing generators: an existing
  /// dependency satisfies the edge and is not re-run.
  fn missing_dependency_closure(&self, seed: &[GeneratorKey]) -> BTreeSet<GeneratorKey> {
    let mut result = BTreeSet::new();
    let mut queue: VecDeque<GeneratorKey> = seed.iter().cloned().collect();
    while let Some(key) = queue.pop_front() {
      for dep in self.dependencies_of(&key) {
        if !self.exists(&dep) && result.insert(dep.clone()) {
          queue.push_back(dep);
        }
      }
    }
    result
  }

  /// All transitive dependents of the seed set (seeds excluded),
  /// regardless of whether they exist.
  fn dependent_closure(&self, seed: &BTreeSet<GeneratorKey>) -> BTreeSet<GeneratorKey> {
    let mut result = BTreeSet::new();
    let mut queue: VecDeque<GeneratorKey> = seed.iter().cloned().collect();
    while let Some(key) = queue.pop_front() {
      for dependent in self.dependents_of(&key) {
        if !seed.contains(&dependent) && result.insert(dependent.clone()) {
          queue.push_back(dependent);
        }
      }
    }
    result
  }

  /// Deterministic topological sort of `subset`.
  ///
  /// Dependency edges are restricted to `subset`; among ready nodes the
  /// smallest key runs first.
  fn toposort_subset(
    &self,
    subset: &BTreeSet<GeneratorKey>,
  ) -> Result<Vec<GeneratorKey>, ClosureError> {
    let mut indegree: BTreeMap<&GeneratorKey, usize> = BTreeMap::new();
    for key in subset {
      let within = self
        .dependencies_of(key)
        .into_iter()
        .filter(|dep| subset.contains(dep))
        .count();
      indegree.insert(key, within);
    }

    let mut ready: BTreeSet<&GeneratorKey> = indegree
      .iter()
      .filter(|(_, deg)| **deg == 0)
      .map(|(&key, _)| key)
      .collect();
    let mut order = Vec::with_capacity(subset.len());

    while let Some(&key) = ready.iter().next() {
      ready.remove(key);
      order.push(key.clone());
      for dependent in self.dependents_of(key) {
        let Some(member) = subset.get(&dependent) else {
          continue;
        };
        if let Some(entry) = indegree.get_mut(member) {
          *entry -= 1;
          if *entry == 0 {
            ready.insert(member);
          }
        }
      }
    }

    if order.len() != subset.len() {
      let members: Vec<String> = subset
        .iter()
        .filter(|key| !order.contains(key))
        .map(|key| key.to_string())
        .collect();
      return Err(ClosureError::Cycle { members });
    }
    debug!(count = order.len(), "computed closure order");
    Ok(order)
  }
}

/// Errors from graph construction or closure computation.
#[derive(Debug, Error)]
pub enum ClosureError {
  #[error("unknown generator '{generator}' requested")]
  UnknownGenerator { generator: String },

  #[error("generator '{generator}' depends on unknown generator '{dependency}'")]
  UnknownDependency {
    generator: String,
    dependency: String,
  },

  #[error(
    "shared generator '{generator}' depends on machine-scoped generator '{dependency}'; \
     shared generators may only depend on shared generators"
  )]
  SharedDependsOnMachine {
    generator: String,
    dependency: String,
  },

  #[error("dependency cycle among generators: {}", .members.join(", "))]
  Cycle { members: Vec<String> },
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::{DependencyRef, Var};

  fn generator(name: &str, deps: &[&str]) -> Generator {
    Generator {
      name: name.to_string(),
      script: "true".to_string(),
      share: false,
      files: vec![Var::public("value")],
      prompts: Vec::new(),
      dependencies: deps
        .iter()
        .map(|d| DependencyRef::machine_scoped(*d))
        .collect(),
      migrate_from: None,
      validation_hash: None,
    }
  }

  /// A machine-scoped chain a -> b -> c on machine "m" with the given
  /// existing generators.
  fn chain(existing: &[&str]) -> GeneratorGraph {
    let mut nodes = BTreeMap::new();
    for (name, deps) in [("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])] {
      let deps: Vec<&str> = deps;
      nodes.insert(
        GeneratorKey::machine("m", name),
        GeneratorNode {
          generator: generator(name, &deps),
          exists: existing.contains(&name),
        },
      );
    }
    GeneratorGraph::new(nodes).unwrap()
  }

  fn names(keys: &[GeneratorKey]) -> Vec<&str> {
    keys.iter().map(|k| k.name.as_str()).collect()
  }

  #[test]
  fn full_closure_orders_by_dependencies() {
    let graph = chain(&["a", "b", "c"]);
    assert_eq!(names(&graph.full_closure().unwrap()), ["a", "b", "c"]);
  }

  #[test]
  fn all_missing_closure_when_nothing_exists() {
    let graph = chain(&[]);
    assert_eq!(
      names(&graph.all_missing_closure().unwrap()),
      ["a", "b", "c"]
    );
  }

  #[test]
  fn all_missing_closure_pulls_in_dependents_of_missing() {
    // Only a is missing: b and c are valid but built on a stale input.
    let graph = chain(&["b", "c"]);
    assert_eq!(
      names(&graph.all_missing_closure().unwrap()),
      ["a", "b", "c"]
    );
  }

  #[test]
  fn all_missing_closure_leaf_only() {
    let graph = chain(&["a", "b"]);
    assert_eq!(names(&graph.all_missing_closure().unwrap()), ["c"]);
  }

  #[test]
  fn requested_closure_fills_gaps_but_not_valid_deps() {
    // a and b exist; requesting c re-runs only c.
    let graph = chain(&["a", "b"]);
    let requested = [GeneratorKey::machine("m", "c")];
    assert_eq!(names(&graph.requested_closure(&requested).unwrap()), ["c"]);
  }

  #[test]
  fn requested_closure_pulls_in_dependents() {
    let graph = chain(&["a", "b", "c"]);
    let requested = [GeneratorKey::machine("m", "a")];
    assert_eq!(
      names(&graph.requested_closure(&requested).unwrap()),
      ["a", "b", "c"]
    );
  }

  #[test]
  fn requested_closure_includes_missing_dependency_chain() {
    // Nothing exists; requesting c must run the whole chain.
    let graph = chain(&[]);
    let requested = [GeneratorKey::machine("m", "c")];
    assert_eq!(
      names(&graph.requested_closure(&requested).unwrap()),
      ["a", "b", "c"]
    );
  }

  #[test]
  fn minimal_closure_is_idempotent() {
    let graph = chain(&["a", "b"]);
    let requested = [GeneratorKey::machine("m", "c")];
    assert_eq!(names(&graph.minimal_closure(&requested).unwrap()), ["c"]);

    // After generation everything exists and the result is empty.
    let satisfied = chain(&["a", "b", "c"]);
    assert!(satisfied.minimal_closure(&requested).unwrap().is_empty());
  }

  #[test]
  fn minimal_closure_ignores_dependents() {
    let graph = chain(&["b", "c"]);
    let requested = [GeneratorKey::machine("m", "a")];
    assert_eq!(names(&graph.minimal_closure(&requested).unwrap()), ["a"]);
  }

  #[test]
  fn ties_break_by_ascending_name() {
    let mut nodes = BTreeMap::new();
    for name in ["zeta", "alpha", "mid"] {
      nodes.insert(
        GeneratorKey::machine("m", name),
        GeneratorNode {
          generator: generator(name, &[]),
          exists: false,
        },
      );
    }
    let graph = GeneratorGraph::new(nodes).unwrap();
    assert_eq!(
      names(&graph.full_closure().unwrap()),
      ["alpha", "mid", "zeta"]
    );
  }

  #[test]
  fn shared_generator_may_not_depend_on_machine_scoped() {
    let mut shared = generator("wifi", &[]);
    shared.share = true;
    shared.dependencies = vec![DependencyRef::machine_scoped("hostkey")];

    let mut nodes = BTreeMap::new();
    nodes.insert(
      GeneratorKey::shared("wifi"),
      GeneratorNode {
        generator: shared,
        exists: false,
      },
    );
    nodes.insert(
      GeneratorKey::machine("m", "hostkey"),
      GeneratorNode {
        generator: generator("hostkey", &[]),
        exists: false,
      },
    );

    let err = GeneratorGraph::new(nodes).unwrap_err();
    assert!(matches!(
      err,
      ClosureError::SharedDependsOnMachine { .. }
    ));
  }

  #[test]
  fn machine_generator_may_depend_on_shared() {
    let mut shared = generator("ca", &[]);
    shared.share = true;

    let mut dependent = generator("cert", &[]);
    dependent.dependencies = vec![DependencyRef::shared("ca")];

    let mut nodes = BTreeMap::new();
    nodes.insert(
      GeneratorKey::shared("ca"),
      GeneratorNode {
        generator: shared,
        exists: false,
      },
    );
    nodes.insert(
      GeneratorKey::machine("m", "cert"),
      GeneratorNode {
        generator: dependent,
        exists: false,
      },
    );

    let graph = GeneratorGraph::new(nodes).unwrap();
    let order = graph.full_closure().unwrap();
    assert_eq!(names(&order), ["ca", "cert"]);
    assert!(order[0].is_shared());
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let mut nodes = BTreeMap::new();
    nodes.insert(
      GeneratorKey::machine("m", "b"),
      GeneratorNode {
        generator: generator("b", &["a"]),
        exists: false,
      },
    );
    let err = GeneratorGraph::new(nodes).unwrap_err();
    assert!(matches!(err, ClosureError::UnknownDependency { .. }));
  }

  #[test]
  fn unknown_requested_generator_is_rejected() {
    let graph = chain(&[]);
    let err = graph
      .minimal_closure(&[GeneratorKey::machine("m", "nope")])
      .unwrap_err();
    assert!(matches!(err, ClosureError::UnknownGenerator { .. }));
  }

  #[test]
  fn cycles_are_detected_at_construction() {
    let mut nodes = BTreeMap::new();
    nodes.insert(
      GeneratorKey::machine("m", "a"),
      GeneratorNode {
        generator: generator("a", &["b"]),
        exists: false,
      },
    );
    nodes.insert(
      GeneratorKey::machine("m", "b"),
      GeneratorNode {
        generator: generator("b", &["a"]),
        exists: false,
      },
    );
    let err = GeneratorGraph::new(nodes).unwrap_err();
    match err {
      ClosureError::Cycle { members } => {
        assert_eq!(members, vec!["m/a".to_string(), "m/b".to_string()]);
      }
      other => panic!("expected cycle error, got {other}"),
    }
  }
}
