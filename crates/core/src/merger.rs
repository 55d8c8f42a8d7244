use crate::config::ExtractionCaps;
use crate::error::GraphEditError;
use crate::models::{ExtractionResult, Graph, GraphEdge, GraphNode};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_NODE_TYPE: &str = "Concept";
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

type EdgeKey = (String, String, String, String);

/// Builds the section graph from the successful chunk results.
///
/// Entities are deduplicated by exact (trimmed) name and the first type seen
/// wins. Node ids run `n1, n2, ...` in first-seen order, so callers that need
/// stable ids pass results in chunk order. Relation endpoints missing from the
/// entity lists become nodes of type `Concept`. Identical edges are kept once.
pub fn merge_section_graph(section_id: &str, results: &[ExtractionResult], caps: &ExtractionCaps) -> Graph {
    let mut builder = GraphBuilder::new(section_id);

    for result in results {
        for entity in result.entities.iter().take(caps.max_entities) {
            builder.ensure_node(entity.name.trim(), Some(entity.entity_type.trim()));
        }
        for relation in result.relations.iter().take(caps.max_relations) {
            let source = relation.source.trim();
            let target = relation.target.trim();
            if source.is_empty() || target.is_empty() {
                continue;
            }
            builder.ensure_node(source, None);
            builder.ensure_node(target, None);
            builder.push_edge(
                source,
                target,
                relation.relation.trim(),
                relation.evidence.trim(),
                relation
                    .confidence
                    .filter(|value| value.is_finite() && (0.0..=1.0).contains(value))
                    .unwrap_or(DEFAULT_CONFIDENCE),
            );
        }
    }

    builder.finish()
}

struct GraphBuilder {
    graph: Graph,
    seen_nodes: HashSet<String>,
    seen_edges: HashSet<EdgeKey>,
}

impl GraphBuilder {
    fn new(section_id: &str) -> Self {
        Self {
            graph: Graph::empty(section_id),
            seen_nodes: HashSet::new(),
            seen_edges: HashSet::new(),
        }
    }

    fn ensure_node(&mut self, name: &str, node_type: Option<&str>) {
        if name.is_empty() || !self.seen_nodes.insert(name.to_string()) {
            return;
        }
        let node_type = node_type.filter(|value| !value.is_empty()).unwrap_or(DEFAULT_NODE_TYPE);
        self.graph.nodes.push(GraphNode {
            id: format!("n{}", self.graph.nodes.len() + 1),
            name: name.to_string(),
            node_type: node_type.to_string(),
        });
    }

    fn push_edge(&mut self, source: &str, target: &str, relation: &str, evidence: &str, confidence: f64) {
        let key = (source.to_string(), target.to_string(), relation.to_string(), evidence.to_string());
        if !self.seen_edges.insert(key) {
            return;
        }
        self.graph.edges.push(GraphEdge {
            id: format!("e{}", self.graph.edges.len() + 1),
            source: source.to_string(),
            target: target.to_string(),
            relation: relation.to_string(),
            evidence: evidence.to_string(),
            confidence,
        });
    }

    fn finish(self) -> Graph {
        self.graph
    }
}

/// Renames a node and rewrites every edge endpoint that referenced it.
/// Renaming onto a name that already exists merges the two nodes.
pub fn rename_node(graph: &mut Graph, old_name: &str, new_name: &str) -> Result<(), GraphEditError> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err(GraphEditError::EmptyName);
    }
    let Some(position) = graph.nodes.iter().position(|node| node.name == old_name) else {
        return Err(GraphEditError::NodeNotFound(old_name.to_string()));
    };
    if old_name == new_name {
        return Ok(());
    }

    if graph.node(new_name).is_some() {
        graph.nodes.remove(position);
    } else {
        graph.nodes[position].name = new_name.to_string();
    }

    for edge in &mut graph.edges {
        if edge.source == old_name {
            edge.source = new_name.to_string();
        }
        if edge.target == old_name {
            edge.target = new_name.to_string();
        }
    }

    let mut seen = HashSet::new();
    graph.edges.retain(|edge| {
        seen.insert((
            edge.source.clone(),
            edge.target.clone(),
            edge.relation.clone(),
            edge.evidence.clone(),
        ))
    });

    Ok(())
}

/// Node and edge content keyed by name, ignoring ids. Used to compare graphs
/// built from results that completed in a different order.
pub fn graph_content(graph: &Graph) -> (HashMap<String, String>, HashSet<(String, String, String, String, u64)>) {
    let nodes = graph
        .nodes
        .iter()
        .map(|node| (node.name.clone(), node.node_type.clone()))
        .collect();
    let edges = graph
        .edges
        .iter()
        .map(|edge| {
            (
                edge.source.clone(),
                edge.target.clone(),
                edge.relation.clone(),
                edge.evidence.clone(),
                edge.confidence.to_bits(),
            )
        })
        .collect();
    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, Relation};

    fn entity(name: &str, entity_type: &str) -> Entity {
        Entity {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            count: 1,
            properties: None,
        }
    }

    fn relation(source: &str, target: &str, relation: &str) -> Relation {
        Relation {
            source: source.to_string(),
            target: target.to_string(),
            relation: relation.to_string(),
            evidence: format!("{source} {relation} {target}"),
            confidence: None,
        }
    }

    fn sample_results() -> Vec<ExtractionResult> {
        vec![
            ExtractionResult {
                entities: vec![entity("Rust", "Language"), entity("Cargo", "Tool")],
                relations: vec![relation("Rust", "Cargo", "ships with")],
            },
            ExtractionResult {
                entities: vec![entity("Rust", "Technology"), entity("Crates.io", "Service")],
                relations: vec![relation("Cargo", "Crates.io", "downloads from"), relation("Rust", "LLVM", "compiles via")],
            },
        ]
    }

    #[test]
    fn entities_are_deduplicated_and_first_type_wins() {
        let graph = merge_section_graph("s1", &sample_results(), &ExtractionCaps::default());

        assert_eq!(graph.section_id, "s1");
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.node("Rust").map(|node| node.node_type.as_str()), Some("Language"));
        assert_eq!(graph.node("LLVM").map(|node| node.node_type.as_str()), Some(DEFAULT_NODE_TYPE));
        assert!(graph.dangling_edges().is_empty());
        assert!(graph.edges.iter().all(|edge| edge.confidence == DEFAULT_CONFIDENCE));
    }

    #[test]
    fn remerging_is_idempotent_in_content() {
        let results = sample_results();
        let mut reversed = results.clone();
        reversed.reverse();

        let first = merge_section_graph("s1", &results, &ExtractionCaps::default());
        let again = merge_section_graph("s1", &results, &ExtractionCaps::default());
        assert_eq!(graph_content(&first), graph_content(&again));

        let reordered = merge_section_graph("s1", &reversed, &ExtractionCaps::default());
        assert_eq!(graph_content(&first).1, graph_content(&reordered).1);
        let names = |graph: &Graph| graph.nodes.iter().map(|node| node.name.clone()).collect::<HashSet<_>>();
        assert_eq!(names(&first), names(&reordered));
    }

    #[test]
    fn caps_bound_each_result() {
        let caps = ExtractionCaps {
            max_entities: 2,
            max_relations: 1,
        };
        let result = ExtractionResult {
            entities: (0..5).map(|index| entity(&format!("E{index}"), "T")).collect(),
            relations: vec![relation("E0", "E1", "a"), relation("E1", "E2", "b")],
        };

        let graph = merge_section_graph("s1", &[result], &caps);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn blank_endpoints_and_bad_confidence_are_handled() {
        let mut confident = relation("A", "B", "likes");
        confident.confidence = Some(0.9);
        let mut broken = relation("A", "C", "hates");
        broken.confidence = Some(f64::NAN);
        let result = ExtractionResult {
            entities: vec![entity("  ", "T")],
            relations: vec![confident, broken, relation("", "B", "orphan"), relation("A", "B", "likes")],
        };

        let graph = merge_section_graph("s1", &[result], &ExtractionCaps::default());
        let confidences = graph.edges.iter().map(|edge| edge.confidence).collect::<Vec<_>>();
        assert_eq!(confidences, [0.9, DEFAULT_CONFIDENCE]);
        assert!(graph.node("").is_none());
    }

    #[test]
    fn empty_result_set_builds_an_empty_graph() {
        let graph = merge_section_graph("s1", &[], &ExtractionCaps::default());
        assert!(graph.nodes.is_empty());
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn rename_cascades_into_edges() {
        let mut graph = merge_section_graph("s1", &sample_results(), &ExtractionCaps::default());
        rename_node(&mut graph, "Rust", "Rust Language").unwrap();

        assert!(graph.node("Rust").is_none());
        assert!(graph.node("Rust Language").is_some());
        assert!(graph.edges.iter().all(|edge| edge.source != "Rust" && edge.target != "Rust"));
        assert_eq!(graph.edges.iter().filter(|edge| edge.source == "Rust Language").count(), 2);
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn rename_onto_existing_node_merges() {
        let mut graph = merge_section_graph("s1", &sample_results(), &ExtractionCaps::default());
        rename_node(&mut graph, "Crates.io", "Cargo").unwrap();

        assert_eq!(graph.nodes.iter().filter(|node| node.name == "Cargo").count(), 1);
        assert_eq!(graph.node("Cargo").map(|node| node.node_type.as_str()), Some("Tool"));
        assert!(graph.dangling_edges().is_empty());
    }

    #[test]
    fn rename_rejects_unknown_and_blank_names() {
        let mut graph = merge_section_graph("s1", &sample_results(), &ExtractionCaps::default());
        assert_eq!(
            rename_node(&mut graph, "Missing", "X"),
            Err(GraphEditError::NodeNotFound("Missing".to_string()))
        );
        assert_eq!(rename_node(&mut graph, "Rust", " "), Err(GraphEditError::EmptyName));
    }
}
