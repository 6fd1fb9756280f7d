//! pcap / pcapng 파일 입력
//!
//! 파일 앞 4바이트로 형식을 고르고 `pcap-parser`의 스트리밍 리더로 블록을
//! 하나씩 읽습니다. 링크 타입은 첫 레이어 프로토콜로 바뀝니다.
//!
//! | 링크 타입 | 첫 레이어 |
//! |---|---|
//! | ETHERNET | `ethernet` |
//! | RAW, IPV4 | `ipv4` |
//! | IPV6 | `ipv6` |

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use pcap_parser::pcapng::Block;
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{LegacyPcapReader, Linktype, PcapBlockOwned, PcapError, PcapNGReader};
use tokio_util::sync::CancellationToken;

use crate::error::InputError;
use crate::frame::Frame;
use crate::registry::{ProtoId, ProtocolRegistry};

use super::{Input, InputCaps, ReadOutcome};

const READER_CAPACITY: usize = 65536;
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
/// 진전 없이 연속으로 `Incomplete`가 나오면 잘린 파일로 봄
const MAX_STALLED_REFILLS: u32 = 3;

enum Reader {
    Legacy(LegacyPcapReader<File>),
    Ng(PcapNGReader<File>),
}

impl Reader {
    fn get(&mut self) -> &mut dyn PcapReaderIterator {
        match self {
            Self::Legacy(r) => r,
            Self::Ng(r) => r,
        }
    }
}

/// 링크 타입 → 프로토콜 변환과 인터페이스별 시각 해상도
#[derive(Default)]
struct LinkState {
    ethernet: Option<ProtoId>,
    ipv4: Option<ProtoId>,
    ipv6: Option<ProtoId>,
    snaplen: usize,
    /// (첫 레이어, 나노초 여부)
    legacy: Option<(ProtoId, bool)>,
    /// pcapng 인터페이스별 (첫 레이어, 초당 단위 수)
    interfaces: Vec<(Option<ProtoId>, u64)>,
    last_ts: Duration,
}

impl LinkState {
    fn resolve(&self, link: Linktype) -> Option<ProtoId> {
        if link == Linktype::ETHERNET {
            self.ethernet
        } else if link == Linktype::RAW || link == Linktype::IPV4 {
            self.ipv4
        } else if link == Linktype::IPV6 {
            self.ipv6
        } else {
            None
        }
    }

    fn frame(&mut self, data: &[u8], ts: Duration, proto: ProtoId) -> Frame {
        let len = data.len().min(self.snaplen);
        self.last_ts = ts;
        Frame::new(Bytes::copy_from_slice(&data[..len]), ts, proto)
    }

    fn handle(&mut self, block: PcapBlockOwned<'_>) -> Result<Option<Frame>, InputError> {
        match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                let proto = self
                    .resolve(hdr.network)
                    .ok_or(InputError::UnsupportedLinkType(hdr.network.0))?;
                self.legacy = Some((proto, hdr.is_nanosecond_precision()));
                Ok(None)
            }
            PcapBlockOwned::Legacy(b) => {
                let (proto, nanos) = self
                    .legacy
                    .ok_or_else(|| InputError::Read("packet before file header".to_owned()))?;
                let frac = if nanos {
                    Duration::from_nanos(u64::from(b.ts_usec))
                } else {
                    Duration::from_micros(u64::from(b.ts_usec))
                };
                let ts = Duration::from_secs(u64::from(b.ts_sec)) + frac;
                Ok(Some(self.frame(b.data, ts, proto)))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.interfaces.clear();
                Ok(None)
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                let proto = self.resolve(idb.linktype);
                if proto.is_none() {
                    tracing::warn!(
                        interface = self.interfaces.len(),
                        linktype = idb.linktype.0,
                        "unsupported link type, packets on this interface are skipped"
                    );
                }
                self.interfaces.push((proto, ts_units(idb.if_tsresol)));
                Ok(None)
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let Some(&(Some(proto), units)) = self.interfaces.get(epb.if_id as usize) else {
                    return Ok(None);
                };
                let raw = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                Ok(Some(self.frame(epb.packet_data(), ts_from_units(raw, units), proto)))
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                let Some(&(Some(proto), _)) = self.interfaces.first() else {
                    return Ok(None);
                };
                let ts = self.last_ts;
                Ok(Some(self.frame(spb.packet_data(), ts, proto)))
            }
            PcapBlockOwned::NG(_) => Ok(None),
        }
    }
}

/// `if_tsresol` → 초당 단위 수 (최상위 비트가 서면 2의 거듭제곱)
fn ts_units(tsresol: u8) -> u64 {
    let exp = u32::from(tsresol & 0x7f);
    let units = if tsresol & 0x80 == 0 {
        10u64.checked_pow(exp)
    } else {
        1u64.checked_shl(exp)
    };
    units.filter(|&u| u > 0).unwrap_or(1_000_000)
}

fn ts_from_units(raw: u64, units: u64) -> Duration {
    let secs = raw / units;
    let frac = u128::from(raw % units) * 1_000_000_000 / u128::from(units);
    Duration::new(secs, u32::try_from(frac).unwrap_or(0))
}

/// pcap / pcapng 파일 재생 입력
pub struct PcapFileInput {
    path: PathBuf,
    reader: Option<Reader>,
    links: LinkState,
    snaplen: u32,
    stalled: u32,
    live: bool,
}

impl PcapFileInput {
    pub fn new(path: impl AsRef<Path>, snaplen: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
            links: LinkState::default(),
            snaplen,
            stalled: 0,
            live: false,
        }
    }

    /// 라이브 캡처처럼 취급합니다 (FIFO/캡처 파이프). 링이 가득 차면 프레임을 버립니다.
    pub fn live(mut self, is_live: bool) -> Self {
        self.live = is_live;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_err(&self, reason: String) -> InputError {
        InputError::Open {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

impl Input for PcapFileInput {
    fn name(&self) -> &str {
        "pcap"
    }

    fn open(&mut self, protocols: &ProtocolRegistry) -> Result<(), InputError> {
        let mut file = File::open(&self.path).map_err(|e| self.open_err(e.to_string()))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .map_err(|e| self.open_err(format!("failed to read file header: {e}")))?;

        let reader = if magic == PCAPNG_MAGIC {
            PcapNGReader::new(READER_CAPACITY, file).map(Reader::Ng)
        } else {
            LegacyPcapReader::new(READER_CAPACITY, file).map(Reader::Legacy)
        }
        .map_err(|e| self.open_err(format!("failed to create reader: {e}")))?;

        self.links = LinkState {
            ethernet: protocols.lookup("ethernet"),
            ipv4: protocols.lookup("ipv4"),
            ipv6: protocols.lookup("ipv6"),
            snaplen: self.snaplen as usize,
            ..LinkState::default()
        };
        self.reader = Some(reader);
        self.stalled = 0;
        tracing::info!(path = %self.path.display(), "pcap input opened");
        Ok(())
    }

    fn read(&mut self, cancel: &CancellationToken) -> Result<ReadOutcome, InputError> {
        let Self {
            reader,
            links,
            stalled,
            ..
        } = self;
        let reader = reader
            .as_mut()
            .ok_or_else(|| InputError::Read("input is not open".to_owned()))?
            .get();

        loop {
            if cancel.is_cancelled() {
                return Err(InputError::Interrupted);
            }
            match reader.next() {
                Ok((offset, block)) => {
                    *stalled = 0;
                    let frame = links.handle(block)?;
                    reader.consume(offset);
                    if let Some(frame) = frame {
                        return Ok(ReadOutcome::Frame(frame));
                    }
                }
                Err(PcapError::Eof) => return Ok(ReadOutcome::Eof),
                Err(PcapError::Incomplete(_)) => {
                    *stalled += 1;
                    if *stalled > MAX_STALLED_REFILLS {
                        tracing::warn!("capture file ends with a truncated block");
                        return Ok(ReadOutcome::Eof);
                    }
                    reader
                        .refill()
                        .map_err(|e| InputError::Read(format!("failed to refill reader: {e}")))?;
                }
                Err(e) => return Err(InputError::Read(format!("pcap parse error: {e}"))),
            }
        }
    }

    fn caps(&self) -> InputCaps {
        InputCaps {
            snaplen: self.snaplen,
            is_live: self.live,
            buffer_alignment: 1,
        }
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(path = %self.path.display(), "pcap input closed");
        }
    }
}
