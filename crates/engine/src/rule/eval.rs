//! 규칙 트리 평가
//!
//! [`node_match`]는 `node`부터 `stop`에 닿을 때까지 트리를 따라가며 레이어를
//! 하나씩 소비합니다. 결과는 참/거짓과 멈춘 위치의 레이어입니다.
//!
//! 아직 식별되지 않은 레이어를 만나면 잎 노드의 프로토콜을 후보로 지연 식별합니다.
//! 식별 결과는 레이어에 남으므로 같은 프레임을 다시 평가해도 `identify`는
//! 다시 호출되지 않습니다. 실패도 남습니다. 첫 레이어는 후보를 받지 않고,
//! 한 번 실패한 후보는 같은 레이어에서 다시 시도하지 않습니다.

use crate::identify::{FrameScope, Halt, Mode, Step, identify_layer};
use crate::layer::LayerId;

use super::tree::{NodeId, NodeKind, RuleTree};

/// 트리 전체를 첫 레이어부터 평가합니다.
///
/// 헬퍼가 패킷을 흡수했거나 손상 패킷이면 `scope.halt`가 설정되고 거짓을 반환합니다.
pub(crate) fn evaluate(scope: &mut FrameScope<'_, '_>, tree: &RuleTree, first: Option<LayerId>) -> bool {
    let (matched, _) = node_match(scope, tree, first, tree.root(), None);
    matched && scope.halt.is_none()
}

/// `node`부터 `stop` 직전까지 평가합니다.
pub(crate) fn node_match(
    scope: &mut FrameScope<'_, '_>,
    tree: &RuleTree,
    mut layer: Option<LayerId>,
    mut node: Option<NodeId>,
    stop: Option<NodeId>,
) -> (bool, Option<LayerId>) {
    loop {
        if node == stop {
            return (true, layer);
        }
        let Some(id) = node else {
            // stop에 닿기 전에 체인이 끝남: 잘못 조립된 트리
            return (false, layer);
        };
        let current = tree.node(id);
        match current.kind() {
            NodeKind::Tail => node = current.a(),

            NodeKind::Leaf {
                proto,
                predicate,
                not,
            } => {
                let Some(lid) = layer else {
                    return (false, None);
                };
                if !scope.pool.get(lid).is_identified() {
                    let l = scope.pool.get(lid);
                    if l.proto().is_undefined() {
                        if l.prev().is_none() || scope.pool.was_rejected(lid, *proto) {
                            return (false, layer);
                        }
                        scope.pool.set_candidate(lid, *proto);
                    }
                    match identify_layer(scope, lid, Mode::Lazy) {
                        Step::Identified => {}
                        Step::Stopped => return (false, layer),
                        Step::Claimed => {
                            scope.halt = Some(Halt::Claimed);
                            return (false, layer);
                        }
                        Step::Malformed => {
                            scope.halt = Some(Halt::Malformed);
                            return (false, layer);
                        }
                    }
                }

                let l = scope.pool.get(lid);
                let ok = if l.proto() == *proto {
                    let holds = predicate.as_ref().is_none_or(|p| {
                        l.field(p.field)
                            .is_some_and(|v| v.compare(p.op, &p.value))
                    });
                    holds != *not
                } else {
                    *not
                };
                if !ok {
                    return (false, layer);
                }
                node = current.a();
                layer = l.next();
            }

            NodeKind::Branch { op, b } => {
                let Some(tail) = tree.tail_of(id) else {
                    debug_assert!(false, "branch without reconvergence tail");
                    return (false, layer);
                };
                let (ra, la) = node_match(scope, tree, layer, current.a(), Some(tail));
                if scope.halt.is_some() {
                    return (false, layer);
                }
                let (rb, lb) = node_match(scope, tree, layer, Some(*b), Some(tail));
                if scope.halt.is_some() || !op.combine(ra, rb) {
                    return (false, layer);
                }

                layer = match (ra, rb) {
                    (true, false) => la,
                    (false, true) => lb,
                    _ if la == lb => la,
                    _ => {
                        // 두 쪽이 서로 다른 깊이에서 멈춤: 각자의 위치에서 나머지를 다시 평가
                        let (fa, fla) = node_match(scope, tree, la, Some(tail), stop);
                        if scope.halt.is_some() {
                            return (false, layer);
                        }
                        let (fb, flb) = node_match(scope, tree, lb, Some(tail), stop);
                        if scope.halt.is_some() {
                            return (false, layer);
                        }
                        let matched = op.combine(fa, fb);
                        return (matched, if fa { fla } else { flb });
                    }
                };
                node = Some(tail);
            }
        }
    }
}
