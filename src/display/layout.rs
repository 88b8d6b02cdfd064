//! A diagram-ready description of a model: nodes, groups and edges.
//!
//! Rendering is left to the caller; this only collects what a renderer needs.

use crate::graph::ReadKind;
use crate::store::{Model, Origin, RefId, RefKind};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

/// Describes the semantic type of a link between two references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// A flow filling a stock. Points from the flow to the stock.
    Inflow,
    /// A flow draining a stock. Points from the stock to the flow.
    Outflow,
    /// An equation reading a current value. Points from the source to the reader.
    Current,
    /// An equation reading a history view.
    History,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutNode {
    pub id: RefId,
    pub name: String,
    pub kind: RefKind,
    pub group: Option<String>,
    pub color_group: Option<String>,
    pub implicit: bool,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEdge {
    pub from: RefId,
    pub to: RefId,
    pub edge: Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub model: String,
    pub nodes: Vec<LayoutNode>,
    pub edges: Vec<LayoutEdge>,
}

impl Layout {
    /// Collects nodes and edges. The time reference is left out, and so is
    /// the hidden state of expanded composites unless `show_hidden` is set.
    pub fn of(model: &Model, show_hidden: bool) -> Self {
        let shown = |id: RefId| {
            model.get(id).is_some_and(|r| {
                r.kind() != RefKind::Time && (show_hidden || r.meta().origin != Origin::Composite)
            })
        };

        let nodes = model
            .iter()
            .filter(|(id, _)| shown(*id))
            .map(|(id, r)| LayoutNode {
                id,
                name: r.name().to_string(),
                kind: r.kind(),
                group: r.meta().group.clone(),
                color_group: r.meta().color_group.clone(),
                implicit: r.is_implicit(),
                origin: r.meta().origin,
            })
            .collect();

        let mut edges: Vec<LayoutEdge> = Vec::new();
        let mut push = |from: RefId, to: RefId, edge: Edge| {
            let link = LayoutEdge { from, to, edge };
            if shown(from) && shown(to) && !edges.contains(&link) {
                edges.push(link);
            }
        };
        for (id, r) in model.iter() {
            for &flow in r.inflows() {
                push(flow, id, Edge::Inflow);
            }
            for &flow in r.outflows() {
                push(id, flow, Edge::Outflow);
            }
            for (_, expr) in r.slots() {
                for read in expr.reads() {
                    let edge = match read.kind {
                        ReadKind::Current => Edge::Current,
                        ReadKind::History => Edge::History,
                    };
                    push(read.id, id, edge);
                }
            }
        }

        Self { model: model.name().to_string(), nodes, edges }
    }

    /// Distinct group names in first-seen order.
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for group in self.nodes.iter().filter_map(|n| n.group.as_deref()) {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups
    }

    /// The layout as a petgraph graph, for callers running their own placement.
    pub fn to_graph(&self) -> DiGraph<String, Edge> {
        let mut graph = DiGraph::new();
        let mut index = std::collections::HashMap::new();
        for node in &self.nodes {
            index.insert(node.id, graph.add_node(node.name.clone()));
        }
        for link in &self.edges {
            if let (Some(&a), Some(&b)) = (index.get(&link.from), index.get(&link.to)) {
                graph.add_edge(a, b, link.edge);
            }
        }
        graph
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
