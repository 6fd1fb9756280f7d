//! 레이어 풀 -- 프레임 하나의 레이어 체인을 담는 아레나
//!
//! 레이어는 프레임마다 할당/해제하지 않습니다. [`LayerPool::reset`]이
//! 사용 개수만 0으로 되돌리고, 다음 프레임은 같은 슬롯(과 필드 저장소)을 재사용합니다.
//! [`LayerId`]는 풀 안의 인덱스이며 `reset` 이후에는 의미가 없습니다.
//!
//! # 불변식
//! 부모가 있는 레이어 L에 대해
//! `L.payload_start + L.payload_size <= P.payload_start + P.payload_size`.
//! 검사는 [`identify`](crate::identify) 단계가 수행합니다.

use std::fmt::Write as _;

use flowmatic_core::Value;

use crate::frame::Frame;
use crate::registry::{ProtoId, ProtocolTable};

/// 레이어 하나가 가질 수 있는 최대 필드 수
pub const MAX_LAYER_FIELDS: usize = 16;

/// 풀 안의 레이어 인덱스
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u32);

impl LayerId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// 식별된 프로토콜 레벨 하나
#[derive(Debug, Clone)]
pub struct Layer {
    proto: ProtoId,
    identified: bool,
    failed: bool,
    rejected: ProtoId,
    start: usize,
    payload_start: usize,
    payload_size: usize,
    fields: Vec<Option<Value>>,
    prev: Option<LayerId>,
    next: Option<LayerId>,
}

impl Layer {
    fn blank() -> Self {
        Self {
            proto: ProtoId::UNDEFINED,
            identified: false,
            failed: false,
            rejected: ProtoId::UNDEFINED,
            start: 0,
            payload_start: 0,
            payload_size: 0,
            fields: Vec::with_capacity(MAX_LAYER_FIELDS),
            prev: None,
            next: None,
        }
    }

    fn recycle(&mut self, proto: ProtoId, prev: Option<LayerId>) {
        self.proto = proto;
        self.identified = false;
        self.failed = false;
        self.rejected = ProtoId::UNDEFINED;
        self.start = 0;
        self.payload_start = 0;
        self.payload_size = 0;
        self.fields.clear();
        self.prev = prev;
        self.next = None;
    }

    pub fn proto(&self) -> ProtoId {
        self.proto
    }

    /// `identify`가 성공했는지 여부
    pub fn is_identified(&self) -> bool {
        self.identified
    }

    /// 식별에 실패해 다시 시도하지 않는 레이어
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// 헤더 시작 오프셋
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn payload_start(&self) -> usize {
        self.payload_start
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn prev(&self) -> Option<LayerId> {
        self.prev
    }

    pub fn next(&self) -> Option<LayerId> {
        self.next
    }

    /// 페이로드 범위를 설정합니다. `identify` 구현이 호출합니다.
    pub fn set_payload(&mut self, start: usize, size: usize) {
        self.payload_start = start;
        self.payload_size = size;
    }

    /// 필드 값을 설정합니다. `idx`가 [`MAX_LAYER_FIELDS`] 이상이면 무시합니다.
    pub fn set_field(&mut self, idx: usize, value: Value) {
        if idx >= MAX_LAYER_FIELDS {
            debug_assert!(false, "field index {idx} out of range");
            return;
        }
        if self.fields.len() <= idx {
            self.fields.resize(idx + 1, None);
        }
        self.fields[idx] = Some(value);
    }

    /// 필드 값을 읽습니다.
    pub fn field(&self, idx: usize) -> Option<&Value> {
        self.fields.get(idx).and_then(Option::as_ref)
    }

    /// 채워진 필드를 `(인덱스, 값)`으로 순회합니다.
    pub fn fields(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
    }
}

/// 재사용 가능한 레이어 아레나
#[derive(Debug)]
pub struct LayerPool {
    layers: Vec<Layer>,
    used: usize,
    max_layers: usize,
    generation: u64,
}

impl LayerPool {
    /// 프레임당 최대 `max_layers`개의 레이어를 담는 풀을 생성합니다.
    pub fn new(max_layers: usize) -> Self {
        Self {
            layers: Vec::with_capacity(max_layers),
            used: 0,
            max_layers,
            generation: 0,
        }
    }

    /// 모든 레이어를 반납합니다. 할당된 저장소는 유지됩니다.
    pub fn reset(&mut self) {
        self.used = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// `reset` 호출 횟수
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 새 레이어를 할당하고 `prev` 뒤에 연결합니다.
    ///
    /// 프레임당 최대 레이어 수에 도달하면 `None`을 반환합니다.
    pub fn alloc(&mut self, proto: ProtoId, prev: Option<LayerId>) -> Option<LayerId> {
        if self.used >= self.max_layers {
            return None;
        }
        let id = LayerId(u32::try_from(self.used).ok()?);
        if self.used == self.layers.len() {
            self.layers.push(Layer::blank());
        }
        self.layers[self.used].recycle(proto, prev);
        self.used += 1;

        if let Some(prev) = prev {
            self.layers[prev.index()].next = Some(id);
        }
        Some(id)
    }

    pub fn get(&self, id: LayerId) -> &Layer {
        debug_assert!(id.index() < self.used, "stale layer id");
        &self.layers[id.index()]
    }

    pub fn get_mut(&mut self, id: LayerId) -> &mut Layer {
        debug_assert!(id.index() < self.used, "stale layer id");
        &mut self.layers[id.index()]
    }

    /// 체인의 첫 레이어 (`reset` 후 처음 할당된 레이어)
    pub fn head(&self) -> Option<LayerId> {
        (self.used > 0).then_some(LayerId(0))
    }

    /// 현재 프레임에 할당된 레이어 수
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// 지금까지 만들어진 슬롯 수 (재사용 확인용)
    pub fn allocated_slots(&self) -> usize {
        self.layers.len()
    }

    /// `id`에서 체인을 끊습니다. `id`의 부모는 더 이상 다음 레이어가 없습니다.
    pub(crate) fn truncate_at(&mut self, id: LayerId) {
        if let Some(prev) = self.get(id).prev {
            self.layers[prev.index()].next = None;
        }
    }

    pub(crate) fn mark_identified(&mut self, id: LayerId, start: usize) {
        let layer = self.get_mut(id);
        layer.identified = true;
        layer.start = start;
    }

    /// 식별을 포기합니다. 이후 `identify`는 호출되지 않습니다.
    pub(crate) fn mark_failed(&mut self, id: LayerId) {
        let layer = self.get_mut(id);
        layer.failed = true;
        layer.fields.clear();
    }

    /// 식별되지 않은 레이어를 후보 프로토콜로 다시 설정합니다.
    pub(crate) fn set_candidate(&mut self, id: LayerId, proto: ProtoId) {
        let layer = self.get_mut(id);
        layer.proto = proto;
        layer.fields.clear();
    }

    /// 지연 식별이 실패한 후보를 기록하고 레이어를 undefined로 되돌립니다.
    pub(crate) fn reject_candidate(&mut self, id: LayerId) {
        let layer = self.get_mut(id);
        layer.rejected = layer.proto;
        layer.proto = ProtoId::UNDEFINED;
        layer.fields.clear();
    }

    /// `proto`가 이 레이어에서 이미 실패한 후보인지 여부
    pub(crate) fn was_rejected(&self, id: LayerId, proto: ProtoId) -> bool {
        let layer = self.get(id);
        !proto.is_undefined() && layer.rejected == proto
    }

    /// `first`부터 체인을 순회합니다.
    pub fn chain(&self, first: Option<LayerId>) -> Chain<'_> {
        Chain {
            pool: self,
            cur: first,
        }
    }
}

/// 레이어 체인 순회자
pub struct Chain<'a> {
    pool: &'a LayerPool,
    cur: Option<LayerId>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (LayerId, &'a Layer);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let layer = self.pool.get(id);
        self.cur = layer.next;
        Some((id, layer))
    }
}

/// 타겟, conntrack, 기대 연결이 보는 프레임 + 레이어 체인
#[derive(Clone, Copy)]
pub struct Packet<'a> {
    frame: &'a Frame,
    pool: &'a LayerPool,
    first: Option<LayerId>,
    protocols: &'a ProtocolTable<'a>,
}

impl<'a> Packet<'a> {
    pub(crate) fn new(
        frame: &'a Frame,
        pool: &'a LayerPool,
        first: Option<LayerId>,
        protocols: &'a ProtocolTable<'a>,
    ) -> Self {
        Self {
            frame,
            pool,
            first,
            protocols,
        }
    }

    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    pub fn data(&self) -> &'a [u8] {
        self.frame.data()
    }

    pub fn protocols(&self) -> &'a ProtocolTable<'a> {
        self.protocols
    }

    /// 식별이 끝난 레이어만 순회합니다.
    pub fn layers(&self) -> impl Iterator<Item = &'a Layer> + 'a {
        self.pool
            .chain(self.first)
            .map(|(_, l)| l)
            .take_while(|l| l.is_identified())
    }

    /// 주어진 프로토콜의 첫 레이어
    pub fn find(&self, proto: ProtoId) -> Option<&'a Layer> {
        self.layers().find(|l| l.proto() == proto)
    }

    /// 이름으로 레이어의 필드 값을 찾습니다 (예: `("ipv4", "src")`).
    pub fn field(&self, proto: &str, field: &str) -> Option<&'a Value> {
        let id = self.protocols.lookup(proto)?;
        let idx = self.protocols.field_index(id, field)?;
        self.find(id)?.field(idx)
    }

    /// 레이어 체인을 `name[start..end]` 목록으로 표현합니다.
    pub fn describe(&self) -> String {
        describe_chain(self.pool, self.first, self.protocols)
    }
}

/// 레이어 체인 덤프 (`ethernet[0..14] > ipv4[14..34] > ...`)
///
/// 손상 패킷 진단 로그와 log 타겟이 사용합니다.
pub fn describe_chain(pool: &LayerPool, first: Option<LayerId>, protocols: &ProtocolTable<'_>) -> String {
    let mut out = String::new();
    for (i, (_, layer)) in pool.chain(first).enumerate() {
        if i > 0 {
            out.push_str(" > ");
        }
        let name = protocols.name(layer.proto());
        if layer.is_identified() {
            let _ = write!(
                out,
                "{name}[{}..{}+{}]",
                layer.start(),
                layer.payload_start(),
                layer.payload_size()
            );
        } else {
            let _ = write!(out, "{name}[?]");
        }
    }
    out
}
