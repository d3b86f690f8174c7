use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::node::node_id::{DomainId, NodeId};


#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub enum IdKind {
    Global,
    Domain,
    Node,
    Application,
}

/// A node in the naming tree `Global -> Domain -> Node -> Application`. Each entry has an explicit
///  parent link, so 'same branch' queries are a walk up the tree.
///
/// This is for diagnostics only - it is never consulted when routing messages.
#[derive(Eq, PartialEq)]
pub struct HierarchyId {
    kind: IdKind,
    name: String,
    parent: Option<Arc<HierarchyId>>,
}

impl HierarchyId {
    pub fn global() -> Arc<HierarchyId> {
        Arc::new(HierarchyId {
            kind: IdKind::Global,
            name: "Global".to_string(),
            parent: None,
        })
    }

    pub fn for_node(domain: &DomainId, node: NodeId) -> Arc<HierarchyId> {
        Self::global()
            .child(IdKind::Domain, &domain.to_string())
            .child(IdKind::Node, &node.to_string())
    }

    pub fn child(self: &Arc<Self>, kind: IdKind, name: &str) -> Arc<HierarchyId> {
        Arc::new(HierarchyId {
            kind,
            name: name.to_string(),
            parent: Some(self.clone()),
        })
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<HierarchyId>> {
        self.parent.as_ref()
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &HierarchyId> {
        std::iter::successors(Some(self), |&id| id.parent.as_deref())
    }

    pub fn ancestor_of_kind(&self, kind: IdKind) -> Option<&HierarchyId> {
        self.ancestors()
            .find(|id| id.kind == kind)
    }

    /// true if one of the two ids is an ancestor of (or equal to) the other
    pub fn is_on_same_branch(&self, other: &HierarchyId) -> bool {
        self.ancestors().any(|a| a == other) || other.ancestors().any(|a| a == self)
    }
}

impl Debug for HierarchyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut path: Vec<&str> = self.ancestors()
            .map(|id| id.name.as_str())
            .collect();
        path.reverse();
        write!(f, "{}", path.join("/"))
    }
}
