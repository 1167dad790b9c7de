use crate::pe::Architecture;
use serde::Serialize;
use std::collections::HashSet;

// reified tree view of the dependency DAG
// a DLL imported by several modules appears once per importer, each occurrence with its own parent
// and depth; nodes live in an arena and refer to each other by index

/// Position of a node in its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    /// Resolved path, or the bare module name if it could not be found
    pub file_path: String,
    pub file_name: String,
    pub architecture: Architecture,
    pub file_version: String,
    pub product_version: String,
    pub exists: bool,
    /// 64-bit importer, 32-bit module
    pub arch_mismatch: bool,
    /// The module is already one of this node's ancestors; children are not expanded
    pub cycle_reference: bool,
    /// Why the file could not be read, if it exists but is not a usable image
    pub error: Option<String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub depth: usize,
}

impl DependencyNode {
    /// Leaf for a module that could not be located
    pub fn missing(module_name: &str) -> Self {
        Self {
            file_path: module_name.to_owned(),
            file_name: module_name.to_owned(),
            architecture: Architecture::Unknown,
            file_version: String::new(),
            product_version: String::new(),
            exists: false,
            arch_mismatch: false,
            cycle_reference: false,
            error: None,
            children: Vec::new(),
            parent: None,
            depth: 0,
        }
    }

    pub fn is_missing(&self) -> bool {
        !self.exists
    }
}

/// Dependency tree of a single scanned file, ordered depth-first: root is first node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyTree {
    pub nodes: Vec<DependencyNode>,
}

impl DependencyTree {
    /// A tree made of the root only
    pub fn new(mut root: DependencyNode) -> Self {
        root.parent = None;
        root.depth = 0;
        root.children.clear();
        Self { nodes: vec![root] }
    }

    /// Append a node below `parent`, fixing up parent link and depth
    pub fn add_child(&mut self, parent: NodeId, mut node: DependencyNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        node.depth = self.nodes[parent.0].depth + 1;
        node.children.clear();
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn root_id(&self) -> NodeId {
        NodeId(0)
    }

    pub fn root(&self) -> &DependencyNode {
        &self.nodes[0]
    }

    pub fn get(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id.0)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &DependencyNode> + '_ {
        self.get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |c| self.get(*c))
    }

    pub fn parent(&self, id: NodeId) -> Option<&DependencyNode> {
        self.get(id)?.parent.and_then(|p| self.get(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn visit_depth_first(&self, mut f: impl FnMut(&DependencyNode)) {
        // the arena holds a depth-first linearization of the tree
        for n in &self.nodes {
            f(n)
        }
    }

    pub fn has_cycle_reference(&self) -> bool {
        self.nodes.iter().any(|n| n.cycle_reference)
    }

    /// Path from the root down to the given node, both included
    pub fn ancestry(&self, id: NodeId) -> Vec<&DependencyNode> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            match self.get(c) {
                Some(n) => {
                    chain.push(n);
                    current = n.parent;
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }
}

/// A node within a collection of trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeLocation {
    pub tree: usize,
    pub node: NodeId,
}

/// All the nodes whose file name matches one of `names`, ignoring case
pub fn find_nodes_by_name<S: AsRef<str>>(forest: &[DependencyTree], names: &[S]) -> Vec<NodeLocation> {
    let wanted: HashSet<String> = names.iter().map(|n| n.as_ref().to_lowercase()).collect();
    forest
        .iter()
        .enumerate()
        .flat_map(|(t, tree)| {
            tree.iter()
                .filter(|(_, n)| wanted.contains(&n.file_name.to_lowercase()))
                .map(move |(id, _)| NodeLocation { tree: t, node: id })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Distinct names of the modules that could not be found anywhere in the forest
///
/// Names are compared ignoring case; the spelling of the first occurrence (depth-first) is kept.
pub fn missing_modules(forest: &[DependencyTree]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ret = Vec::new();
    for tree in forest {
        tree.visit_depth_first(|n| {
            if n.is_missing() && seen.insert(n.file_name.to_lowercase()) {
                ret.push(n.file_name.clone());
            }
        });
    }
    ret
}
