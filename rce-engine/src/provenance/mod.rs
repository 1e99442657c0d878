//! Aggregation provenance DAG
//!
//! Records how lower-level scores combine into higher-level ones
//! (micro → dimension → area → cluster → macro) and answers lineage and
//! attribution queries over that record.
//!
//! Acyclicity is checked explicitly on every edge insertion with a DFS that
//! tracks the recursion stack; a rejected call leaves the graph exactly as
//! it was.

pub mod export;

use crate::error::ProvenanceError;
use chrono::{DateTime, Utc};
use rce_common::{sha256_hex, to_canonical_json};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

/// Default number of sources returned by [`AggregationDag::critical_path`]
pub const DEFAULT_CRITICAL_PATH_K: usize = 5;

/// Abstraction level of a score node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLevel {
    Micro,
    Dimension,
    Area,
    Cluster,
    Macro,
}

impl NodeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLevel::Micro => "micro",
            NodeLevel::Dimension => "dimension",
            NodeLevel::Area => "area",
            NodeLevel::Cluster => "cluster",
            NodeLevel::Macro => "macro",
        }
    }
}

impl fmt::Display for NodeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable score record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvenanceNode {
    node_id: String,
    level: NodeLevel,
    score: f64,
    quality_level: String,
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
}

impl ProvenanceNode {
    pub fn new(node_id: impl Into<String>, level: NodeLevel, score: f64, quality_level: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            level,
            score,
            quality_level: quality_level.into(),
            timestamp: rce_common::time::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn level(&self) -> NodeLevel {
        self.level
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn quality_level(&self) -> &str {
        &self.quality_level
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// First 16 hex chars of SHA-256 over (id, level, score, quality)
    pub fn compute_hash(&self) -> String {
        let content = json!({
            "node_id": self.node_id,
            "level": self.level,
            "score": self.score,
            "quality_level": self.quality_level,
        });
        let digest = sha256_hex(to_canonical_json(&content).as_bytes());
        digest[..16].to_string()
    }
}

/// One source → target contribution of an aggregation step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationEdge {
    pub source_id: String,
    pub target_id: String,
    pub operation: String,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// Result of [`AggregationDag::trace_lineage`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    pub target_id: String,
    pub ancestor_count: usize,
    pub ancestors: Vec<String>,
    pub topological_path: Vec<String>,
    /// Longest path, in edges, ending at the target
    pub depth: usize,
    pub micro_question_count: usize,
    pub micro_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagStatistics {
    pub node_count: usize,
    pub edge_count: usize,
    pub max_depth: usize,
    pub is_dag: bool,
    pub weakly_connected_components: usize,
    pub nodes_by_level: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct AggregationDag {
    nodes: BTreeMap<String, ProvenanceNode>,
    edges: Vec<AggregationEdge>,
}

impl AggregationDag {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // Mutation
    // ========================================

    pub fn add_node(&mut self, node: ProvenanceNode) -> Result<(), ProvenanceError> {
        if self.nodes.contains_key(node.node_id()) {
            return Err(ProvenanceError::DuplicateNode(node.node_id.clone()));
        }
        debug!(node_id = %node.node_id, level = %node.level, score = node.score, "Added provenance node");
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Record `sources → target`, one edge per source
    ///
    /// All nodes must already exist and the weights must be finite,
    /// non-negative and sum to more than zero. If the new edges would close
    /// a cycle, every edge added by this call is removed before the error is
    /// returned.
    pub fn add_aggregation_edge(
        &mut self,
        source_ids: &[&str],
        target_id: &str,
        operation: &str,
        weights: &[f64],
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), ProvenanceError> {
        if source_ids.len() != weights.len() {
            return Err(ProvenanceError::WeightMismatch {
                sources: source_ids.len(),
                weights: weights.len(),
            });
        }
        for id in source_ids.iter().chain(std::iter::once(&target_id)) {
            if !self.nodes.contains_key(*id) {
                return Err(ProvenanceError::UnknownNode(id.to_string()));
            }
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(ProvenanceError::InvalidWeights {
                target_id: target_id.to_string(),
                reason: format!("weight {} is not a finite non-negative number", w),
            });
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ProvenanceError::InvalidWeights {
                target_id: target_id.to_string(),
                reason: "weights sum to zero".to_string(),
            });
        }

        let metadata = metadata.unwrap_or_default();
        let timestamp = rce_common::time::now();
        let checkpoint = self.edges.len();
        for (source_id, weight) in source_ids.iter().zip(weights) {
            self.edges.push(AggregationEdge {
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
                operation: operation.to_string(),
                weight: *weight,
                timestamp,
                metadata: metadata.clone(),
            });
        }

        if let Some((from, to)) = self.find_cycle() {
            self.edges.truncate(checkpoint);
            warn!(
                target_id = %target_id,
                back_edge_from = %from,
                back_edge_to = %to,
                "Rejected aggregation that would create a cycle"
            );
            return Err(ProvenanceError::CycleDetected {
                source_id: from,
                target_id: to,
            });
        }

        info!(
            sources = source_ids.len(),
            target_id = %target_id,
            operation = %operation,
            "Recorded aggregation"
        );
        Ok(())
    }

    // ========================================
    // Accessors
    // ========================================

    pub fn node(&self, node_id: &str) -> Option<&ProvenanceNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProvenanceNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[AggregationEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn require(&self, node_id: &str) -> Result<&ProvenanceNode, ProvenanceError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| ProvenanceError::UnknownNode(node_id.to_string()))
    }

    fn successors(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut map: BTreeMap<&str, BTreeSet<&str>> =
            self.nodes.keys().map(|k| (k.as_str(), BTreeSet::new())).collect();
        for edge in &self.edges {
            map.entry(edge.source_id.as_str())
                .or_default()
                .insert(edge.target_id.as_str());
        }
        map
    }

    fn predecessors(&self) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut map: BTreeMap<&str, BTreeSet<&str>> =
            self.nodes.keys().map(|k| (k.as_str(), BTreeSet::new())).collect();
        for edge in &self.edges {
            map.entry(edge.target_id.as_str())
                .or_default()
                .insert(edge.source_id.as_str());
        }
        map
    }

    // ========================================
    // Cycle detection
    // ========================================

    /// Iterative DFS with an explicit recursion stack; returns a back edge
    fn find_cycle(&self) -> Option<(String, String)> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let successors = self.successors();
        let mut marks: BTreeMap<&str, Mark> = successors.keys().map(|k| (*k, Mark::Unvisited)).collect();

        for start in successors.keys() {
            if marks.get(start) != Some(&Mark::Unvisited) {
                continue;
            }
            let mut stack: Vec<(&str, Vec<&str>)> =
                vec![(*start, successors[start].iter().copied().collect())];
            marks.insert(*start, Mark::OnStack);

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                        Mark::OnStack => return Some((node.to_string(), next.to_string())),
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            let children = successors
                                .get(next)
                                .map(|s| s.iter().copied().collect())
                                .unwrap_or_default();
                            stack.push((next, children));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    pub fn is_dag(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Kahn's algorithm over `subset`; ties broken by node id
    fn topological_order<'a>(&'a self, subset: &BTreeSet<&'a str>) -> Vec<&'a str> {
        let mut in_degree: BTreeMap<&str, usize> = subset.iter().map(|n| (*n, 0)).collect();
        let mut children: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in &self.edges {
            let (s, t) = (edge.source_id.as_str(), edge.target_id.as_str());
            if subset.contains(s) && subset.contains(t) && children.entry(s).or_default().insert(t) {
                *in_degree.entry(t).or_default() += 1;
            }
        }

        let mut ready: BTreeSet<&str> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            if let Some(next) = children.get(node) {
                for child in next {
                    if let Some(d) = in_degree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }
        order
    }

    /// Longest path (in edges) ending at each node of `order`
    fn longest_paths<'a>(&self, order: &[&'a str], subset: &BTreeSet<&str>) -> BTreeMap<&'a str, usize> {
        let predecessors = self.predecessors();
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for node in order {
            let d = predecessors
                .get(node)
                .into_iter()
                .flatten()
                .filter(|p| subset.contains(*p))
                .filter_map(|p| depth.get(p).map(|d| d + 1))
                .max()
                .unwrap_or(0);
            depth.insert(*node, d);
        }
        depth
    }

    // ========================================
    // Queries
    // ========================================

    pub fn trace_lineage(&self, target_id: &str) -> Result<Lineage, ProvenanceError> {
        let target = self.require(target_id)?;
        let predecessors = self.predecessors();

        let mut ancestors: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([target.node_id()]);
        while let Some(node) = queue.pop_front() {
            for parent in predecessors.get(node).into_iter().flatten() {
                if ancestors.insert(*parent) {
                    queue.push_back(*parent);
                }
            }
        }

        let mut subset = ancestors.clone();
        subset.insert(target.node_id());
        let order = self.topological_order(&subset);
        let depth = self
            .longest_paths(&order, &subset)
            .get(target.node_id())
            .copied()
            .unwrap_or(0);

        let micro_questions: Vec<String> = ancestors
            .iter()
            .filter(|id| self.nodes.get(**id).map(|n| n.level == NodeLevel::Micro).unwrap_or(false))
            .map(|id| id.to_string())
            .collect();

        Ok(Lineage {
            target_id: target_id.to_string(),
            ancestor_count: ancestors.len(),
            ancestors: ancestors.iter().map(|a| a.to_string()).collect(),
            topological_path: order.iter().map(|n| n.to_string()).collect(),
            depth,
            micro_question_count: micro_questions.len(),
            micro_questions,
        })
    }

    /// Per-source contribution `weight × score`, rescaled to sum to the target score
    ///
    /// When every contribution is zero the raw map is returned if the target
    /// score is also zero, and `DegenerateAttribution` otherwise.
    pub fn compute_attribution(&self, target_id: &str) -> Result<BTreeMap<String, f64>, ProvenanceError> {
        let target = self.require(target_id)?;

        let mut raw: BTreeMap<String, f64> = BTreeMap::new();
        for edge in self.edges.iter().filter(|e| e.target_id == target_id) {
            let source = self.require(&edge.source_id)?;
            *raw.entry(edge.source_id.clone()).or_insert(0.0) += edge.weight * source.score();
        }
        if raw.is_empty() {
            warn!(target_id = %target_id, "Node has no aggregation sources");
            return Ok(raw);
        }

        let total: f64 = raw.values().sum();
        if total > 0.0 {
            let scale = target.score() / total;
            for value in raw.values_mut() {
                *value *= scale;
            }
        } else if target.score() != 0.0 {
            return Err(ProvenanceError::DegenerateAttribution {
                target_id: target_id.to_string(),
                total,
                score: target.score(),
            });
        }
        Ok(raw)
    }

    /// The `top_k` sources with the largest absolute attribution
    pub fn critical_path(&self, target_id: &str, top_k: usize) -> Result<Vec<(String, f64)>, ProvenanceError> {
        let mut ranked: Vec<(String, f64)> = self.compute_attribution(target_id)?.into_iter().collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);
        Ok(ranked)
    }

    pub fn statistics(&self) -> DagStatistics {
        let all: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        let is_dag = self.is_dag();
        let max_depth = if is_dag {
            let order = self.topological_order(&all);
            self.longest_paths(&order, &all).values().copied().max().unwrap_or(0)
        } else {
            0
        };

        let mut nodes_by_level: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.nodes.values() {
            *nodes_by_level.entry(node.level.as_str().to_string()).or_default() += 1;
        }

        DagStatistics {
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            max_depth,
            is_dag,
            weakly_connected_components: self.weak_components(),
            nodes_by_level,
        }
    }

    /// Union-find over undirected edges
    fn weak_components(&self) -> usize {
        let index: BTreeMap<&str, usize> = self.nodes.keys().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
        let mut parent: Vec<usize> = (0..index.len()).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for edge in &self.edges {
            if let (Some(&a), Some(&b)) = (index.get(edge.source_id.as_str()), index.get(edge.target_id.as_str())) {
                let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                if ra != rb {
                    parent[ra] = rb;
                }
            }
        }
        (0..parent.len()).filter(|i| find(&mut parent, *i) == *i).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Q1, Q2, Q3 → DIM01 → PA01
    fn sample() -> AggregationDag {
        let mut dag = AggregationDag::new();
        dag.add_node(ProvenanceNode::new("Q1", NodeLevel::Micro, 0.9, "EXCELENTE")).unwrap();
        dag.add_node(ProvenanceNode::new("Q2", NodeLevel::Micro, 0.6, "ACEPTABLE")).unwrap();
        dag.add_node(ProvenanceNode::new("Q3", NodeLevel::Micro, 0.3, "INSUFICIENTE")).unwrap();
        dag.add_node(ProvenanceNode::new("DIM01", NodeLevel::Dimension, 0.63, "ACEPTABLE")).unwrap();
        dag.add_node(ProvenanceNode::new("PA01", NodeLevel::Area, 0.63, "ACEPTABLE")).unwrap();
        dag.add_aggregation_edge(&["Q1", "Q2", "Q3"], "DIM01", "weighted_average", &[0.4, 0.3, 0.3], None)
            .unwrap();
        dag.add_aggregation_edge(&["DIM01"], "PA01", "weighted_average", &[1.0], None)
            .unwrap();
        dag
    }

    #[test]
    fn test_node_hash_is_short_and_stable() {
        let a = ProvenanceNode::new("Q1", NodeLevel::Micro, 0.9, "EXCELENTE");
        let b = ProvenanceNode::new("Q1", NodeLevel::Micro, 0.9, "EXCELENTE").with_metadata("k", json!(1));
        assert_eq!(a.compute_hash().len(), 16);
        assert_eq!(a.compute_hash(), b.compute_hash());
        let c = ProvenanceNode::new("Q1", NodeLevel::Micro, 0.8, "EXCELENTE");
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_duplicate_and_unknown_nodes() {
        let mut dag = sample();
        assert!(matches!(
            dag.add_node(ProvenanceNode::new("Q1", NodeLevel::Micro, 0.1, "INSUFICIENTE")),
            Err(ProvenanceError::DuplicateNode(_))
        ));
        assert!(matches!(
            dag.add_aggregation_edge(&["Q9"], "DIM01", "weighted_average", &[1.0], None),
            Err(ProvenanceError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_weight_mismatch() {
        let mut dag = sample();
        let err = dag
            .add_aggregation_edge(&["Q1", "Q2"], "PA01", "weighted_average", &[1.0], None)
            .unwrap_err();
        assert_eq!(err, ProvenanceError::WeightMismatch { sources: 2, weights: 1 });
    }

    #[test]
    fn test_invalid_weights_rejected_without_edges() {
        let mut dag = sample();
        dag.add_node(ProvenanceNode::new("DIM02", NodeLevel::Dimension, 0.3, "INSUFICIENTE")).unwrap();
        let before = dag.edge_count();

        for weights in [[1.0, -1.0], [f64::NAN, 1.0], [f64::INFINITY, 1.0], [0.0, 0.0]] {
            let err = dag
                .add_aggregation_edge(&["Q1", "Q2"], "DIM02", "weighted_average", &weights, None)
                .unwrap_err();
            assert!(matches!(err, ProvenanceError::InvalidWeights { .. }), "{:?}", weights);
            assert_eq!(dag.edge_count(), before);
        }
        assert!(dag.compute_attribution("DIM02").unwrap().is_empty());
    }

    #[test]
    fn test_attribution_rejects_zero_contributions_for_nonzero_target() {
        let mut dag = AggregationDag::new();
        dag.add_node(ProvenanceNode::new("Q1", NodeLevel::Micro, 0.0, "INSUFICIENTE")).unwrap();
        dag.add_node(ProvenanceNode::new("Q2", NodeLevel::Micro, 0.0, "INSUFICIENTE")).unwrap();
        dag.add_node(ProvenanceNode::new("DIM01", NodeLevel::Dimension, 0.3, "INSUFICIENTE")).unwrap();
        dag.add_node(ProvenanceNode::new("DIM02", NodeLevel::Dimension, 0.0, "INSUFICIENTE")).unwrap();
        dag.add_aggregation_edge(&["Q1", "Q2"], "DIM01", "weighted_average", &[0.5, 0.5], None)
            .unwrap();
        dag.add_aggregation_edge(&["Q1", "Q2"], "DIM02", "weighted_average", &[0.5, 0.5], None)
            .unwrap();

        assert!(matches!(
            dag.compute_attribution("DIM01"),
            Err(ProvenanceError::DegenerateAttribution { .. })
        ));
        let zero = dag.compute_attribution("DIM02").unwrap();
        assert_eq!(zero.values().sum::<f64>(), 0.0);
    }

    #[test]
    fn test_cycle_rejected_and_rolled_back() {
        let mut dag = sample();
        let before = dag.edge_count();
        // Q3 → PA01 is fine, PA01 → Q1 closes Q1 → DIM01 → PA01 → Q1
        let err = dag
            .add_aggregation_edge(&["Q3", "PA01"], "Q1", "weighted_average", &[0.5, 0.5], None)
            .unwrap_err();
        assert!(matches!(err, ProvenanceError::CycleDetected { .. }));
        assert_eq!(dag.edge_count(), before);
        assert!(dag.is_dag());

        let err = dag
            .add_aggregation_edge(&["PA01"], "PA01", "identity", &[1.0], None)
            .unwrap_err();
        assert!(matches!(err, ProvenanceError::CycleDetected { .. }));
        assert_eq!(dag.edge_count(), before);
    }

    #[test]
    fn test_trace_lineage() {
        let dag = sample();
        let lineage = dag.trace_lineage("PA01").unwrap();
        assert_eq!(lineage.ancestor_count, 4);
        assert_eq!(lineage.ancestors, vec!["DIM01", "Q1", "Q2", "Q3"]);
        assert_eq!(lineage.depth, 2);
        assert_eq!(lineage.micro_question_count, 3);
        assert_eq!(lineage.topological_path.last().map(String::as_str), Some("PA01"));
        let pos = |id: &str| lineage.topological_path.iter().position(|n| n == id).unwrap();
        assert!(pos("Q2") < pos("DIM01"));

        let leaf = dag.trace_lineage("Q1").unwrap();
        assert_eq!(leaf.ancestor_count, 0);
        assert_eq!(leaf.depth, 0);
        assert_eq!(leaf.topological_path, vec!["Q1"]);

        assert!(dag.trace_lineage("nope").is_err());
    }

    #[test]
    fn test_attribution_sums_to_target_score() {
        let dag = sample();
        let attribution = dag.compute_attribution("DIM01").unwrap();
        let total: f64 = attribution.values().sum();
        assert!((total - 0.63).abs() < 1e-12);
        assert!(attribution["Q1"] > attribution["Q2"]);
        assert!(dag.compute_attribution("Q1").unwrap().is_empty());
    }

    #[test]
    fn test_critical_path() {
        let dag = sample();
        let top = dag.critical_path("DIM01", 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, "Q1");
        assert_eq!(top[1].0, "Q2");
        assert_eq!(dag.critical_path("DIM01", DEFAULT_CRITICAL_PATH_K).unwrap().len(), 3);
    }

    #[test]
    fn test_statistics() {
        let mut dag = sample();
        dag.add_node(ProvenanceNode::new("Q9", NodeLevel::Micro, 0.5, "INSUFICIENTE")).unwrap();
        let stats = dag.statistics();
        assert_eq!(stats.node_count, 6);
        assert_eq!(stats.edge_count, 4);
        assert_eq!(stats.max_depth, 2);
        assert!(stats.is_dag);
        assert_eq!(stats.weakly_connected_components, 2);
        assert_eq!(stats.nodes_by_level["micro"], 4);
    }
}
