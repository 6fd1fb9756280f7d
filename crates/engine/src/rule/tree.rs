//! 규칙 트리 -- 아레나에 저장된 매치 표현식
//!
//! 노드 종류는 세 가지입니다.
//! - `Leaf`: 레이어 하나에 대한 프로토콜 검사 + 선택적 필드 술어 + NOT 플래그
//! - `Branch`: AND/OR. `a`는 왼쪽 하위 체인, `b`는 오른쪽 하위 체인의 머리
//! - `Tail`: 분기의 두 하위 체인이 다시 만나는 지점. `a`가 분기 뒤의 이어지는 체인
//!
//! 모든 체인은 `a`로 단일 연결되며 `b`는 분기에만 있습니다. 두 하위 체인이
//! 같은 `Tail`을 공유하므로 트리는 그 지점에서 DAG가 됩니다. 노드는 인덱스로
//! 참조하므로 공유 노드도 아레나에 한 번만 존재합니다.

use std::sync::OnceLock;

use flowmatic_core::{CmpOp, Value};

use crate::registry::{ProtoId, ProtocolTable};

/// 아레나 안의 노드 인덱스
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// 분기 결합 연산자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    And,
    Or,
}

impl BranchOp {
    pub fn combine(self, a: bool, b: bool) -> bool {
        match self {
            Self::And => a && b,
            Self::Or => a || b,
        }
    }
}

/// 필드 술어 (`ipv4.src == 10.0.0.0/8`)
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: usize,
    pub op: CmpOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Leaf {
        proto: ProtoId,
        predicate: Option<Predicate>,
        not: bool,
    },
    Branch {
        op: BranchOp,
        b: NodeId,
    },
    Tail,
}

#[derive(Debug)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) a: Option<NodeId>,
    /// 분기의 합류 지점. 트리 모양에서만 결정되므로 한 번 계산해 둡니다.
    tail: OnceLock<Option<NodeId>>,
}

impl Node {
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn a(&self) -> Option<NodeId> {
        self.a
    }
}

/// 규칙 하나의 매치 트리
///
/// 잎 노드가 가리키는 프로토콜의 참조 카운트를 쥐고 있으므로
/// 버릴 때는 반드시 [`RuleTree::destroy`]를 호출해야 합니다.
#[derive(Debug)]
pub struct RuleTree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    text: String,
}

impl RuleTree {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            text: text.to_owned(),
        }
    }

    pub(crate) fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Node {
            kind,
            a: None,
            tail: OnceLock::new(),
        });
        id
    }

    pub(crate) fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.index()].a = Some(to);
    }

    pub(crate) fn set_root(&mut self, root: Option<NodeId>) {
        self.root = root;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 규칙 원문
    pub fn text(&self) -> &str {
        &self.text
    }

    /// 분기의 합류 `Tail`을 찾습니다.
    ///
    /// 왼쪽 하위 체인을 `a`로 따라가며 분기를 만나면 깊이를 올리고 `Tail`을 만나면
    /// 내립니다. 깊이가 0이 되는 `Tail`이 이 분기의 합류 지점입니다.
    pub fn tail_of(&self, branch: NodeId) -> Option<NodeId> {
        *self.nodes[branch.index()].tail.get_or_init(|| {
            let mut depth = 1usize;
            let mut cur = self.node(branch).a;
            while let Some(id) = cur {
                match self.node(id).kind {
                    NodeKind::Branch { .. } => depth += 1,
                    NodeKind::Tail => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(id);
                        }
                    }
                    NodeKind::Leaf { .. } => {}
                }
                cur = self.node(id).a;
            }
            None
        })
    }

    /// 루트에서 닿는 모든 노드를 한 번씩 방문합니다 (`a` 먼저, 그다음 `b`).
    pub fn visit(&self, mut f: impl FnMut(NodeId, &Node)) -> usize {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        let mut visited = 0;
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            visited += 1;
            let node = self.node(id);
            f(id, node);
            if let NodeKind::Branch { b, .. } = node.kind {
                stack.push(b);
            }
            if let Some(a) = node.a {
                stack.push(a);
            }
        }
        visited
    }

    /// 트리를 파기하고 잎 노드의 프로토콜 참조를 반납합니다.
    ///
    /// 공유 `Tail`을 포함해 각 노드는 정확히 한 번 방문됩니다. 방문한 노드 수를 반환합니다.
    pub fn destroy(self, protocols: &ProtocolTable<'_>) -> usize {
        let visited = self.visit(|_, node| {
            if let NodeKind::Leaf { proto, .. } = node.kind {
                protocols.release(proto);
            }
        });
        debug_assert_eq!(visited, self.nodes.len(), "unreachable rule nodes");
        visited
    }

    /// 잎 노드가 참조하는 프로토콜 (중복 포함)
    pub fn protocols(&self) -> Vec<ProtoId> {
        let mut out = Vec::new();
        self.visit(|_, node| {
            if let NodeKind::Leaf { proto, .. } = node.kind {
                out.push(proto);
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tree: &mut RuleTree, raw: u16) -> NodeId {
        tree.push(NodeKind::Leaf {
            proto: ProtoId::from_raw(raw),
            predicate: None,
            not: false,
        })
    }

    /// `x and (y or z)`를 손으로 조립합니다.
    fn nested() -> (RuleTree, NodeId, NodeId) {
        let mut t = RuleTree::new("x and (y or z)");
        let x = leaf(&mut t, 1);
        let y = leaf(&mut t, 2);
        let z = leaf(&mut t, 3);
        let inner_tail = t.push(NodeKind::Tail);
        let inner = t.push(NodeKind::Branch { op: BranchOp::Or, b: z });
        t.link(inner, y);
        t.link(y, inner_tail);
        t.link(z, inner_tail);
        let outer_tail = t.push(NodeKind::Tail);
        let outer = t.push(NodeKind::Branch { op: BranchOp::And, b: inner });
        t.link(outer, x);
        t.link(x, outer_tail);
        t.link(inner_tail, outer_tail);
        t.set_root(Some(outer));
        (t, outer, inner)
    }

    #[test]
    fn tail_lookup_skips_nested_branches() {
        let (t, outer, inner) = nested();
        assert_eq!(t.tail_of(outer), Some(NodeId(6)));
        assert_eq!(t.tail_of(inner), Some(NodeId(3)));
        // 캐시된 값도 같아야 함
        assert_eq!(t.tail_of(outer), Some(NodeId(6)));
    }

    #[test]
    fn visit_reaches_shared_tail_once() {
        let (t, _, _) = nested();
        let mut tails = 0;
        let visited = t.visit(|_, n| {
            if n.kind == NodeKind::Tail {
                tails += 1;
            }
        });
        assert_eq!(visited, t.len());
        assert_eq!(tails, 2);
    }

    #[test]
    fn combine_follows_operator() {
        assert!(BranchOp::Or.combine(false, true));
        assert!(!BranchOp::And.combine(false, true));
        assert!(BranchOp::And.combine(true, true));
    }
}
