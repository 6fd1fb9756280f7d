//! 타입 값(ptype) -- 필드 값과 파라미터 값의 공통 표현
//!
//! 프로토콜 필드, 규칙 술어의 비교 값, 엔진 파라미터가 모두 [`Value`]를 사용합니다.
//! 지원 연산: 문자열 파싱, 출력(`Display`), serde 직렬화, 순서 비교.
//!
//! # 비교 규칙
//! - 같은 종류끼리만 비교합니다. 종류가 다르면 항상 `false`입니다.
//! - MAC, 문자열, bool은 `==`/`!=`만 의미가 있고, 순서 연산자는 `false`입니다.
//! - 오른쪽 값이 `Ipv4Net`이면 `==`/`!=`는 프리픽스 포함 여부를 검사합니다.

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// 값의 종류 (필드 스키마에 기록됨)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    Ipv4,
    Ipv6,
    Mac,
    Str,
}

impl ValueKind {
    /// 소문자 이름을 반환합니다.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Mac => "mac",
            Self::Str => "string",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 48비트 MAC 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// 바이트 슬라이스 앞 6바이트로 주소를 만듭니다.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for slot in &mut out {
            let part = parts.next().ok_or_else(|| "expected 6 octets".to_owned())?;
            if part.is_empty() || part.len() > 2 {
                return Err(format!("invalid octet '{part}'"));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|e| e.to_string())?;
        }
        if parts.next().is_some() {
            return Err("expected 6 octets".to_owned());
        }
        Ok(Self(out))
    }
}

/// 비교 연산자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CmpOp {
    /// 연산자 기호를 반환합니다.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Neq => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CmpOp {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" | "eq" => Ok(Self::Eq),
            "!=" | "neq" => Ok(Self::Neq),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "le" => Ok(Self::Le),
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "ge" => Ok(Self::Ge),
            other => Err(ValueError::UnknownOperator(other.to_owned())),
        }
    }
}

/// 타입이 지정된 값
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ipv4(Ipv4Addr),
    /// 프리픽스 표기(`10.0.0.0/8`)로 파싱된 IPv4 대역
    Ipv4Net(Ipv4Addr, u8),
    Ipv6(Ipv6Addr),
    Mac(MacAddr),
    Str(String),
}

impl Value {
    /// 문자열을 `kind` 타입의 값으로 파싱합니다.
    ///
    /// 정수는 10진수 또는 `0x` 접두어 16진수를 받습니다.
    /// `Ipv4`는 `a.b.c.d/len` 대역 표기도 받습니다.
    pub fn parse(kind: ValueKind, input: &str) -> Result<Self, ValueError> {
        let text = input.trim();
        let invalid = |reason: String| ValueError::Invalid {
            kind,
            input: input.to_owned(),
            reason,
        };

        match kind {
            ValueKind::Bool => match text {
                "true" | "yes" | "on" | "1" => Ok(Self::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Self::Bool(false)),
                _ => Err(invalid("expected true/false".to_owned())),
            },
            ValueKind::U8 => parse_uint(text)
                .and_then(|v| u8::try_from(v).map_err(|e| e.to_string()))
                .map(Self::U8)
                .map_err(invalid),
            ValueKind::U16 => parse_uint(text)
                .and_then(|v| u16::try_from(v).map_err(|e| e.to_string()))
                .map(Self::U16)
                .map_err(invalid),
            ValueKind::U32 => parse_uint(text)
                .and_then(|v| u32::try_from(v).map_err(|e| e.to_string()))
                .map(Self::U32)
                .map_err(invalid),
            ValueKind::U64 => parse_uint(text).map(Self::U64).map_err(invalid),
            ValueKind::Ipv4 => match text.split_once('/') {
                Some((addr, len)) => {
                    let addr: Ipv4Addr = addr.parse().map_err(|e| invalid(format!("{e}")))?;
                    let len: u8 = len.parse().map_err(|e| invalid(format!("{e}")))?;
                    if len > 32 {
                        return Err(invalid("prefix length must be 0-32".to_owned()));
                    }
                    Ok(Self::Ipv4Net(addr, len))
                }
                None => text
                    .parse()
                    .map(Self::Ipv4)
                    .map_err(|e| invalid(format!("{e}"))),
            },
            ValueKind::Ipv6 => text
                .parse()
                .map(Self::Ipv6)
                .map_err(|e| invalid(format!("{e}"))),
            ValueKind::Mac => text.parse().map(Self::Mac).map_err(invalid),
            ValueKind::Str => Ok(Self::Str(text.to_owned())),
        }
    }

    /// 값의 종류를 반환합니다. `Ipv4Net`은 `Ipv4`로 취급합니다.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::U8(_) => ValueKind::U8,
            Self::U16(_) => ValueKind::U16,
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
            Self::Ipv4(_) | Self::Ipv4Net(..) => ValueKind::Ipv4,
            Self::Ipv6(_) => ValueKind::Ipv6,
            Self::Mac(_) => ValueKind::Mac,
            Self::Str(_) => ValueKind::Str,
        }
    }

    /// `self op rhs`를 평가합니다.
    ///
    /// `self`는 패킷에서 읽은 필드 값, `rhs`는 규칙에 적힌 비교 값입니다.
    pub fn compare(&self, op: CmpOp, rhs: &Value) -> bool {
        if let (Self::Ipv4(addr), Self::Ipv4Net(net, len)) = (self, rhs) {
            let inside = prefix_contains(*net, *len, *addr);
            return match op {
                CmpOp::Eq => inside,
                CmpOp::Neq => !inside,
                _ => false,
            };
        }

        match self.ordering(rhs) {
            Some(ord) => op.holds(ord),
            None => match op {
                CmpOp::Eq => self == rhs,
                CmpOp::Neq => self.kind() == rhs.kind() && self != rhs,
                _ => false,
            },
        }
    }

    /// 순서가 정의된 종류끼리의 비교 결과
    fn ordering(&self, rhs: &Value) -> Option<Ordering> {
        match (self, rhs) {
            (Self::U8(a), Self::U8(b)) => Some(a.cmp(b)),
            (Self::U16(a), Self::U16(b)) => Some(a.cmp(b)),
            (Self::U32(a), Self::U32(b)) => Some(a.cmp(b)),
            (Self::U64(a), Self::U64(b)) => Some(a.cmp(b)),
            (Self::Ipv4(a), Self::Ipv4(b)) => Some(a.cmp(b)),
            (Self::Ipv6(a), Self::Ipv6(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// 정수형 값을 `u64`로 읽습니다.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(u64::from(v)),
            Self::U16(v) => Some(u64::from(v)),
            Self::U32(v) => Some(u64::from(v)),
            Self::U64(v) => Some(v),
            _ => None,
        }
    }

    /// bool 값을 읽습니다.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::Ipv4(v) => write!(f, "{v}"),
            Self::Ipv4Net(v, len) => write!(f, "{v}/{len}"),
            Self::Ipv6(v) => write!(f, "{v}"),
            Self::Mac(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

fn parse_uint(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|e| e.to_string())
}

fn prefix_contains(net: Ipv4Addr, len: u8, addr: Ipv4Addr) -> bool {
    if len == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - u32::from(len.min(32)));
    (u32::from(net) & mask) == (u32::from(addr) & mask)
}
