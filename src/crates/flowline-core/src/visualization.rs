//! Plan rendering in DOT, Mermaid, and plain text.
//!
//! Rendering helps while developing a pipeline: check the wiring before
//! running it, paste a diagram into documentation, or dump the structure
//! when a build error is surprising.
//!
//! - **DOT**: `dot -Tpng plan.dot -o plan.png` for publication-quality
//!   diagrams.
//! - **Mermaid**: renders natively in GitHub/GitLab markdown.
//! - **Text**: one line per node and edge, for logs and terminals.
//!
//! ```rust,ignore
//! let plan = builder.build()?;
//! println!("{}", visualize(&plan, &VisualizationOptions::mermaid()));
//! ```

use crate::node::NodeKind;
use crate::plan::Plan;

/// Output format for [`visualize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    Dot,
    Mermaid,
    Text,
}

/// Rendering options.
#[derive(Debug, Clone)]
pub struct VisualizationOptions {
    pub format: VisualizationFormat,
    pub title: Option<String>,
}

impl VisualizationOptions {
    pub fn dot() -> Self {
        VisualizationOptions {
            format: VisualizationFormat::Dot,
            title: None,
        }
    }

    pub fn mermaid() -> Self {
        VisualizationOptions {
            format: VisualizationFormat::Mermaid,
            title: None,
        }
    }

    pub fn text() -> Self {
        VisualizationOptions {
            format: VisualizationFormat::Text,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Render `plan` in the requested format.
pub fn visualize(plan: &Plan, options: &VisualizationOptions) -> String {
    match options.format {
        VisualizationFormat::Dot => render_dot(plan, options),
        VisualizationFormat::Mermaid => render_mermaid(plan, options),
        VisualizationFormat::Text => plan.summary(),
    }
}

fn dot_shape(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Source => "invhouse",
        NodeKind::Sink => "house",
        NodeKind::Join | NodeKind::Aggregate => "hexagon",
        NodeKind::Broadcast => "triangle",
        NodeKind::Transform | NodeKind::Tap => "box",
    }
}

fn render_dot(plan: &Plan, options: &VisualizationOptions) -> String {
    let mut out = String::from("digraph flowline {\n");
    out.push_str("    rankdir=LR;\n");
    out.push_str("    node [style=rounded];\n");
    if let Some(title) = &options.title {
        out.push_str(&format!("    label=\"{}\";\n", title));
    }
    for (idx, node) in plan.nodes().iter().enumerate() {
        out.push_str(&format!(
            "    n{idx} [label=\"{}\\n({})\", shape={}];\n",
            node.name,
            node.kind,
            dot_shape(node.kind),
        ));
    }
    for edge in plan.edges() {
        out.push_str(&format!(
            "    n{} -> n{} [label=\"{}\"];\n",
            edge.producer.node,
            edge.consumer.node,
            short_type(edge.type_name),
        ));
    }
    out.push_str("}\n");
    out
}

fn render_mermaid(plan: &Plan, options: &VisualizationOptions) -> String {
    let mut out = String::from("graph LR\n");
    if let Some(title) = &options.title {
        out.push_str(&format!("    %% {}\n", title));
    }
    for (idx, node) in plan.nodes().iter().enumerate() {
        let label = format!("{} ({})", node.name, node.kind);
        match node.kind {
            NodeKind::Source | NodeKind::Sink => {
                out.push_str(&format!("    n{idx}([\"{label}\"])\n"))
            }
            NodeKind::Join | NodeKind::Aggregate => {
                out.push_str(&format!("    n{idx}{{{{\"{label}\"}}}}\n"))
            }
            _ => out.push_str(&format!("    n{idx}[\"{label}\"]\n")),
        }
    }
    for edge in plan.edges() {
        out.push_str(&format!(
            "    n{} -->|{}| n{}\n",
            edge.producer.node,
            short_type(edge.type_name),
            edge.consumer.node,
        ));
    }
    out
}

/// Trim module paths out of a type name: `alloc::string::String` renders
/// as `String`.
fn short_type(full: &str) -> String {
    let mut out = String::new();
    let mut segment = String::new();
    for c in full.chars() {
        match c {
            ':' => segment.clear(),
            '<' | '>' | ',' | '(' | ')' | ' ' => {
                out.push_str(&segment);
                segment.clear();
                out.push(c);
            }
            _ => segment.push(c),
        }
    }
    out.push_str(&segment);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::node::{map_fn, sink_fn, source_iter};

    fn sample_plan() -> Plan {
        let mut g = GraphBuilder::new();
        let src = g.add_source("numbers", || source_iter(vec![1i64]));
        let double = g.add_transform("double", || map_fn(|n: i64| n * 2));
        let sink = g.add_sink("out", || sink_fn(|_: i64| {}));
        g.connect(&src, &double);
        g.connect(&double, &sink);
        g.build().expect("valid plan")
    }

    #[test]
    fn dot_lists_every_node_and_edge() {
        let plan = sample_plan();
        let dot = visualize(&plan, &VisualizationOptions::dot().with_title("demo"));
        assert!(dot.starts_with("digraph flowline {"));
        assert!(dot.contains("label=\"demo\""));
        assert!(dot.contains("numbers"));
        assert!(dot.contains("double"));
        assert!(dot.contains("n0 -> n1") || dot.contains("n1 -> n2") || dot.contains("->"));
        assert_eq!(dot.matches("->").count(), plan.edge_count());
    }

    #[test]
    fn mermaid_renders_node_kinds() {
        let plan = sample_plan();
        let mermaid = visualize(&plan, &VisualizationOptions::mermaid());
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("numbers (source)"));
        assert!(mermaid.contains("double (transform)"));
        assert!(mermaid.contains("-->|i64|"));
    }

    #[test]
    fn short_type_trims_paths() {
        assert_eq!(short_type("alloc::string::String"), "String");
        assert_eq!(
            short_type("(alloc::string::String, f64)"),
            "(String, f64)"
        );
        assert_eq!(
            short_type("alloc::vec::Vec<core::option::Option<i64>>"),
            "Vec<Option<i64>>"
        );
    }
}
