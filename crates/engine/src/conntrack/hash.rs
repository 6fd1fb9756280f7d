//! Bob Jenkins lookup2 기반 32비트 믹싱 해시 (`jhash_*words`)
//!
//! 프로토콜별 흐름 해시 기여값과 conntrack 테이블의 누적 해시에 사용합니다.
//! 순서에 민감하므로 `jhash_2words(a, b) != jhash_2words(b, a)`입니다.

const GOLDEN_RATIO: u32 = 0x9e37_79b9;

#[inline]
fn mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 13);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 8);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 13);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 12);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 16);
    c = c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 5);
    a = a.wrapping_sub(b).wrapping_sub(c) ^ (c >> 3);
    b = b.wrapping_sub(c).wrapping_sub(a) ^ (a << 10);
    c.wrapping_sub(a).wrapping_sub(b) ^ (b >> 15)
}

pub fn jhash_3words(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    mix(
        a.wrapping_add(GOLDEN_RATIO),
        b.wrapping_add(GOLDEN_RATIO),
        c.wrapping_add(initval),
    )
}

pub fn jhash_2words(a: u32, b: u32, initval: u32) -> u32 {
    jhash_3words(a, b, 0, initval)
}

pub fn jhash_1word(a: u32, initval: u32) -> u32 {
    jhash_3words(a, 0, 0, initval)
}
