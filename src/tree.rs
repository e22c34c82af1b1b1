use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs::File, io::BufReader, path::Path};

/// A clade of a rooted phylogenetic tree, as deserialized from the JSON
/// export format (nested objects with an optional `name`,
/// `branch_length`, `confidence`, and a `children` array; other fields
/// are ignored).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TreeNode {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub branch_length: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Load a tree from a JSON file. The root branch length is forced to
    /// 0.01 so the root is visible in a phylogram.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or deserialized.
    pub fn from_json_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let reader = BufReader::new(file);

        let mut tree: TreeNode =
            serde_json::from_reader(reader).context("failed to deserialize tree")?;
        tree.branch_length = Some(0.01);

        Ok(tree)
    }

    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    pub fn count_tips(&self) -> usize {
        if self.is_tip() {
            1
        } else {
            self.children.iter().map(TreeNode::count_tips).sum()
        }
    }

    fn max_depth(&self, x_start: f64) -> f64 {
        let x_here = x_start + self.branch_length.unwrap_or(0.0);
        self.children
            .iter()
            .map(|child| child.max_depth(x_here))
            .fold(x_here, f64::max)
    }
}

/// A line segment in layout coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// A text anchor in layout coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub x: f64,
    pub y: f64,
    pub text: String,
}

/// Rooted phylogram layout: x is cumulative branch length from the root,
/// y counts tip rows from the top (tips sit at 1, 2, ...; internal nodes
/// at the midpoint of their first and last child). Renderers must invert
/// the y axis to put the first tip on top.
#[derive(Debug, Default)]
pub struct TreeLayout {
    pub branches: Vec<Segment>,
    pub connectors: Vec<Segment>,
    pub tip_labels: Vec<Label>,
    pub branch_labels: Vec<Label>,
    pub x_max: f64,
    pub y_max: f64,
}

/// Compute the phylogram layout of a tree.
///
/// When no node carries a positive branch length, unit branch lengths are
/// substituted so the tree still spreads out horizontally. Confidence
/// values become labels at branch midpoints when `show_confidence` is
/// set.
pub fn layout(tree: &TreeNode, show_confidence: bool) -> TreeLayout {
    let unit_lengths = tree.max_depth(0.0) <= 0.0;

    let mut result = TreeLayout::default();
    let mut next_tip = 0usize;
    layout_clade(
        tree,
        0.0,
        unit_lengths,
        show_confidence,
        &mut next_tip,
        &mut result,
    );

    result.y_max = next_tip as f64;
    result
}

/// Recursively lay out one clade; returns its y position.
fn layout_clade(
    node: &TreeNode,
    x_start: f64,
    unit_lengths: bool,
    show_confidence: bool,
    next_tip: &mut usize,
    result: &mut TreeLayout,
) -> f64 {
    let length = if unit_lengths {
        1.0
    } else {
        node.branch_length.unwrap_or(0.0)
    };
    let x_here = x_start + length;
    result.x_max = result.x_max.max(x_here);

    let y_here = if node.is_tip() {
        *next_tip += 1;
        *next_tip as f64
    } else {
        let child_ys: Vec<f64> = node
            .children
            .iter()
            .map(|child| {
                layout_clade(
                    child,
                    x_here,
                    unit_lengths,
                    show_confidence,
                    next_tip,
                    result,
                )
            })
            .collect();

        // Vertical connector spans the first and last child.
        let y_first = child_ys[0];
        let y_last = child_ys[child_ys.len() - 1];
        result.connectors.push(Segment {
            x0: x_here,
            y0: y_first,
            x1: x_here,
            y1: y_last,
        });
        0.5 * (y_first + y_last)
    };

    result.branches.push(Segment {
        x0: x_start,
        y0: y_here,
        x1: x_here,
        y1: y_here,
    });

    if let Some(name) = &node.name {
        result.tip_labels.push(Label {
            x: x_here,
            y: y_here,
            text: name.clone(),
        });
    }
    if show_confidence && let Some(confidence) = node.confidence {
        result.branch_labels.push(Label {
            x: 0.5 * (x_start + x_here),
            y: y_here,
            text: format_confidence(confidence),
        });
    }

    y_here
}

fn format_confidence(confidence: f64) -> String {
    if confidence.fract() == 0.0 {
        format!("{}", confidence as i64)
    } else {
        format!("{confidence}")
    }
}
