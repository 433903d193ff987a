//! Looking at what a run would do, without running anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::error::RunnerError;
use crate::graph::Graph;

impl Graph {
    /// The dependency closure of `name` in an order where every task comes
    /// after all of its dependencies.
    ///
    /// Missing tasks are reported in the order a run would reach them: depth
    /// first, dependencies in declaration order.
    pub fn plan<'a>(&'a self, name: &'a str) -> Result<Vec<String>, RunnerError> {
        let mut dag: DiGraphMap<&str, ()> = DiGraphMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![name];

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }

            let node = self
                .get(current)
                .ok_or_else(|| RunnerError::TaskNotFound(current.to_string()))?;

            dag.add_node(current);
            for dep in &node.dependencies {
                // Edges point from a dependency to its dependent.
                dag.add_edge(dep.as_str(), current, ());
            }
            for dep in node.dependencies.iter().rev() {
                stack.push(dep.as_str());
            }
        }

        let order = toposort(&dag, None)
            .map_err(|cycle| RunnerError::CycleDetected(cycle.node_id().to_string()))?;

        Ok(order.into_iter().map(str::to_string).collect())
    }
}

/// A Mermaid flowchart of a task graph.
///
/// Edges to tasks that are not registered are drawn dashed, from a node
/// labelled as missing.
pub(crate) struct Mermaid(pub BTreeMap<String, Vec<String>>);

impl Display for Mermaid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let ids: HashMap<&str, usize> = self
            .0
            .keys()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for (name, id) in self.0.keys().zip(0..) {
            writeln!(f, "    n{id}[\"{}\"]", escape(name))?;
        }

        let mut missing: Vec<&str> = Vec::new();

        for (name, deps) in &self.0 {
            let target = ids[name.as_str()];

            for dep in deps {
                match ids.get(dep.as_str()) {
                    Some(source) => writeln!(f, "    n{source} --> n{target}")?,
                    None => {
                        let source = match missing.iter().position(|m| *m == dep) {
                            Some(i) => i,
                            None => {
                                missing.push(dep);
                                let id = missing.len() - 1;
                                writeln!(f, "    m{id}[\"{} (missing)\"]", escape(dep))?;
                                id
                            }
                        };
                        writeln!(f, "    m{source} -.-> n{target}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn escape(name: &str) -> String {
    name.replace('"', "#quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::Work;
    use pretty_assertions::assert_eq;

    fn graph(edges: &[(&str, &[&str])]) -> Graph {
        let mut graph = Graph::default();
        for (name, deps) in edges {
            graph
                .insert(name, (*deps).into(), Work::noop(), false)
                .unwrap();
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let graph = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("unrelated", &[]),
        ]);

        let order = graph.plan("d").unwrap();

        assert_eq!(order.len(), 4);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "d"));
        assert!(position(&order, "c") < position(&order, "d"));
    }

    #[test]
    fn plan_reports_first_missing_task() {
        let graph = graph(&[("top", &["x", "y"]), ("x", &["gone"])]);

        let err = graph.plan("top").unwrap_err();

        assert!(matches!(err, RunnerError::TaskNotFound(name) if name == "gone"));
    }

    #[test]
    fn plan_reports_cycles() {
        let graph = graph(&[("a", &["b"]), ("b", &["a"]), ("self", &["self"])]);

        assert!(matches!(graph.plan("a"), Err(RunnerError::CycleDetected(_))));
        assert!(matches!(
            graph.plan("self"),
            Err(RunnerError::CycleDetected(name)) if name == "self"
        ));
    }

    #[test]
    fn mermaid_marks_missing_tasks() {
        let graph = graph(&[("a", &[]), ("b", &["a", "ghost"])]);

        let rendered = Mermaid(graph.list()).to_string();

        let expected = concat!(
            "graph LR\n",
            "    n0[\"a\"]\n",
            "    n1[\"b\"]\n",
            "    n0 --> n1\n",
            "    m0[\"ghost (missing)\"]\n",
            "    m0 -.-> n1\n",
        );
        assert_eq!(rendered, expected);
    }
}
