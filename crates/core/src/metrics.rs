//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 엔진과 데몬은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `flowmatic_`
//! - 모듈명: `input_`, `engine_`, `conntrack_`, `helper_`, `expectation_`, `target_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(flowmatic_core::metrics::ENGINE_FRAMES_PROCESSED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 규칙 ID 레이블 키
pub const LABEL_RULE: &str = "rule";

/// 타겟 종류 레이블 키 (null, log, expect-reverse)
pub const LABEL_TARGET: &str = "target";

/// 드롭 사유 레이블 키 (malformed, overflow)
pub const LABEL_REASON: &str = "reason";

// ─── Input 메트릭 ──────────────────────────────────────────────────

/// Input: 입력에서 읽은 프레임 수 (counter)
pub const INPUT_FRAMES_READ_TOTAL: &str = "flowmatic_input_frames_read_total";

/// Input: 링 버퍼가 가득 차서 버린 프레임 수 (counter, 라이브 입력 전용)
pub const INPUT_RING_OVERFLOW_TOTAL: &str = "flowmatic_input_ring_overflow_total";

// ─── Engine 메트릭 ─────────────────────────────────────────────────

/// Engine: 규칙 평가까지 도달한 프레임 수 (counter)
pub const ENGINE_FRAMES_PROCESSED_TOTAL: &str = "flowmatic_engine_frames_processed_total";

/// Engine: 손상 패킷으로 버린 프레임 수 (counter, label: reason)
pub const ENGINE_FRAMES_DROPPED_TOTAL: &str = "flowmatic_engine_frames_dropped_total";

/// Engine: 헬퍼가 흡수한 프레임 수 (counter)
pub const ENGINE_FRAMES_CLAIMED_TOTAL: &str = "flowmatic_engine_frames_claimed_total";

/// Engine: 헬퍼가 재주입한 프레임 수 (counter)
pub const ENGINE_FRAMES_REINJECTED_TOTAL: &str = "flowmatic_engine_frames_reinjected_total";

/// Engine: 규칙 매칭 수 (counter, label: rule)
pub const ENGINE_RULE_MATCHES_TOTAL: &str = "flowmatic_engine_rule_matches_total";

/// Engine: 프레임 하나의 처리 시간 (histogram, 초)
pub const ENGINE_FRAME_PROCESSING_DURATION_SECONDS: &str =
    "flowmatic_engine_frame_processing_duration_seconds";

// ─── Conntrack 메트릭 ──────────────────────────────────────────────

/// Conntrack: 현재 살아있는 연결 엔트리 수 (gauge)
pub const CONNTRACK_ENTRIES: &str = "flowmatic_conntrack_entries";

/// Conntrack: 생성된 연결 엔트리 수 (counter)
pub const CONNTRACK_CREATED_TOTAL: &str = "flowmatic_conntrack_created_total";

/// Conntrack: 파기된 연결 엔트리 수 (counter)
pub const CONNTRACK_DESTROYED_TOTAL: &str = "flowmatic_conntrack_destroyed_total";

// ─── Helper 메트릭 ─────────────────────────────────────────────────

/// Helper: 재조립이 끝난 IPv4 조각 그룹 수 (counter)
pub const HELPER_FRAGMENTS_REASSEMBLED_TOTAL: &str =
    "flowmatic_helper_fragments_reassembled_total";

/// Helper: 만료로 버린 IPv4 조각 그룹 수 (counter)
pub const HELPER_FRAGMENT_GROUPS_EXPIRED_TOTAL: &str =
    "flowmatic_helper_fragment_groups_expired_total";

// ─── Expectation 메트릭 ────────────────────────────────────────────

/// Expectation: 매칭되어 소비된 기대 연결 수 (counter)
pub const EXPECTATION_MATCHED_TOTAL: &str = "flowmatic_expectation_matched_total";

/// Expectation: 매칭 없이 만료된 기대 연결 수 (counter)
pub const EXPECTATION_EXPIRED_TOTAL: &str = "flowmatic_expectation_expired_total";

// ─── Target 메트릭 ─────────────────────────────────────────────────

/// Target: 처리 실패로 닫힌 타겟 수 (counter, label: target)
pub const TARGET_ERRORS_TOTAL: &str = "flowmatic_target_errors_total";

// ─── Daemon 메트릭 ─────────────────────────────────────────────────

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "flowmatic_daemon_build_info";

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "flowmatic_daemon_uptime_seconds";

/// Daemon: 로드된 규칙 수 (gauge)
pub const DAEMON_RULES_LOADED: &str = "flowmatic_daemon_rules_loaded";

/// 프레임 처리 시간 히스토그램 버킷 (초)
pub const FRAME_DURATION_BUCKETS: &[f64] = &[
    0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.01,
];

/// 정의된 모든 메트릭 이름
pub const ALL_METRIC_NAMES: &[&str] = &[
    INPUT_FRAMES_READ_TOTAL,
    INPUT_RING_OVERFLOW_TOTAL,
    ENGINE_FRAMES_PROCESSED_TOTAL,
    ENGINE_FRAMES_DROPPED_TOTAL,
    ENGINE_FRAMES_CLAIMED_TOTAL,
    ENGINE_FRAMES_REINJECTED_TOTAL,
    ENGINE_RULE_MATCHES_TOTAL,
    ENGINE_FRAME_PROCESSING_DURATION_SECONDS,
    CONNTRACK_ENTRIES,
    CONNTRACK_CREATED_TOTAL,
    CONNTRACK_DESTROYED_TOTAL,
    HELPER_FRAGMENTS_REASSEMBLED_TOTAL,
    HELPER_FRAGMENT_GROUPS_EXPIRED_TOTAL,
    EXPECTATION_MATCHED_TOTAL,
    EXPECTATION_EXPIRED_TOTAL,
    TARGET_ERRORS_TOTAL,
    DAEMON_BUILD_INFO,
    DAEMON_UPTIME_SECONDS,
    DAEMON_RULES_LOADED,
];

/// 모든 메트릭의 설명을 등록합니다.
///
/// 전역 recorder 설치 직후 한 번 호출합니다. recorder가 없으면 아무 일도 하지 않습니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Input
    describe_counter!(
        INPUT_FRAMES_READ_TOTAL,
        "Total number of frames read from the input source"
    );
    describe_counter!(
        INPUT_RING_OVERFLOW_TOTAL,
        "Frames dropped because the ring buffer was full (live inputs only)"
    );

    // Engine
    describe_counter!(
        ENGINE_FRAMES_PROCESSED_TOTAL,
        "Frames that reached rule evaluation"
    );
    describe_counter!(
        ENGINE_FRAMES_DROPPED_TOTAL,
        "Frames dropped as malformed"
    );
    describe_counter!(
        ENGINE_FRAMES_CLAIMED_TOTAL,
        "Frames absorbed by a helper (e.g. buffered fragments)"
    );
    describe_counter!(
        ENGINE_FRAMES_REINJECTED_TOTAL,
        "Reconstructed frames reinjected by helpers"
    );
    describe_counter!(ENGINE_RULE_MATCHES_TOTAL, "Rule matches per rule id");
    describe_histogram!(
        ENGINE_FRAME_PROCESSING_DURATION_SECONDS,
        "Per-frame pipeline latency in seconds"
    );

    // Conntrack
    describe_gauge!(CONNTRACK_ENTRIES, "Live connection tracking entries");
    describe_counter!(CONNTRACK_CREATED_TOTAL, "Connection entries created");
    describe_counter!(CONNTRACK_DESTROYED_TOTAL, "Connection entries destroyed");

    // Helper
    describe_counter!(
        HELPER_FRAGMENTS_REASSEMBLED_TOTAL,
        "IPv4 fragment groups reassembled and reinjected"
    );
    describe_counter!(
        HELPER_FRAGMENT_GROUPS_EXPIRED_TOTAL,
        "IPv4 fragment groups dropped on timeout"
    );

    // Expectation
    describe_counter!(
        EXPECTATION_MATCHED_TOTAL,
        "Expectations consumed by a matching frame"
    );
    describe_counter!(
        EXPECTATION_EXPIRED_TOTAL,
        "Expectations that timed out without a match"
    );

    // Target
    describe_counter!(TARGET_ERRORS_TOTAL, "Targets closed after a processing error");

    // Daemon
    describe_gauge!(DAEMON_BUILD_INFO, "Daemon build information");
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(DAEMON_RULES_LOADED, "Rules loaded into the engine");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_start_with_flowmatic_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("flowmatic_"),
                "Metric '{}' does not start with 'flowmatic_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn describe_all_does_not_panic() {
        describe_all();
    }

    #[test]
    fn duration_buckets_are_sorted() {
        for pair in FRAME_DURATION_BUCKETS.windows(2) {
            assert!(pair[1] > pair[0], "Bucket values must be in ascending order");
        }
    }
}
