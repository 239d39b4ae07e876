//! 로컬 파일(basis)에서 원격 record 의 블록을 찾는다.
//!
//! rolling checksum 으로 후보를 고르고 BLAKE3 로 확정한다.
//! 블록 위치가 밀린 경우(앞부분 삽입 등)도 찾는다.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use super::record::{BlockChecksum, FilePartsRecord};
use super::rolling::RollingChecksum;
use crate::range::Range;

/// 읽기 버퍼 최소 크기
const MIN_READ_BUFFER: usize = 256 * 1024;

/// 찾은 블록: 원격 파일의 `block_index` 블록이 basis 의 `basis_offset` 에 있음
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub block_index: usize,
    pub basis_offset: u64,
}

/// 블록 매처
pub struct FileMatcher<'a> {
    record: &'a FilePartsRecord,
    /// rolling 값 -> 전체 크기 블록 인덱스 목록
    table: HashMap<u32, Vec<usize>>,
}

impl<'a> FileMatcher<'a> {
    pub fn new(record: &'a FilePartsRecord) -> Self {
        let block_size = record.block_size() as u64;
        let mut table: HashMap<u32, Vec<usize>> = HashMap::new();
        for (index, block) in record.blocks().iter().enumerate() {
            if record.block_range(index).length == block_size {
                table.entry(block.rolling).or_default().push(index);
            }
        }
        Self { record, table }
    }

    /// basis 전체를 훑어 일치하는 블록 목록 반환 (블록 인덱스 순)
    pub fn find_matches<R: Read + Seek>(
        &self,
        mut basis: R,
        basis_length: u64,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> std::io::Result<Vec<BlockMatch>> {
        let block_size = self.record.block_size() as usize;
        let mut found: Vec<Option<u64>> = vec![None; self.record.block_count()];

        basis.seek(SeekFrom::Start(0))?;
        let read_size = MIN_READ_BUFFER.max(block_size * 4);
        let mut buf: Vec<u8> = Vec::with_capacity(read_size * 2);
        // buf[0] 의 basis 상 절대 오프셋
        let mut buf_offset: u64 = 0;
        let mut pos: usize = 0;
        let mut eof = self.table.is_empty();
        let mut rolling: Option<RollingChecksum> = None;

        while !(eof && buf.len() < pos + block_size) {
            // 윈도우 + 다음 바이트 하나가 버퍼에 있도록 채움
            if !eof && buf.len() < pos + block_size + 1 {
                buf.drain(..pos);
                buf_offset += pos as u64;
                pos = 0;
                eof = fill(&mut basis, &mut buf, read_size)?;
                if basis_length > 0 {
                    let read = (buf_offset + buf.len() as u64) as f64;
                    progress((read / basis_length as f64).min(1.0));
                }
                continue;
            }

            let window = &buf[pos..pos + block_size];
            let sum = *rolling.get_or_insert_with(|| RollingChecksum::new(window));

            let mut matched = false;
            if let Some(candidates) = self.table.get(&sum.value()) {
                let strong = BlockChecksum::of(window).strong;
                for &index in candidates {
                    if found[index].is_none() && self.record.blocks()[index].strong == strong {
                        found[index] = Some(buf_offset + pos as u64);
                        matched = true;
                    }
                }
            }

            if matched {
                pos += block_size;
                rolling = None;
            } else if pos + block_size < buf.len() {
                if let Some(r) = rolling.as_mut() {
                    r.roll(buf[pos], buf[pos + block_size]);
                }
                pos += 1;
            } else {
                break;
            }
        }

        self.match_tail_block(&mut basis, basis_length, &mut found)?;
        progress(1.0);

        Ok(found
            .into_iter()
            .enumerate()
            .filter_map(|(block_index, offset)| {
                offset.map(|basis_offset| BlockMatch {
                    block_index,
                    basis_offset,
                })
            })
            .collect())
    }

    /// 마지막 블록이 짧으면 rolling 검색 대상이 아니므로
    /// 같은 오프셋과 basis 끝, 두 위치만 직접 비교한다.
    fn match_tail_block<R: Read + Seek>(
        &self,
        basis: &mut R,
        basis_length: u64,
        found: &mut [Option<u64>],
    ) -> std::io::Result<()> {
        let Some(index) = self.record.block_count().checked_sub(1) else {
            return Ok(());
        };
        let range = self.record.block_range(index);
        if range.length == 0 || range.length == self.record.block_size() as u64 {
            return Ok(());
        }
        if basis_length < range.length {
            return Ok(());
        }

        let expected = self.record.blocks()[index].strong;
        let mut bytes = vec![0u8; range.length as usize];
        for offset in [range.start, basis_length - range.length] {
            if offset + range.length > basis_length {
                continue;
            }
            basis.seek(SeekFrom::Start(offset))?;
            basis.read_exact(&mut bytes)?;
            if BlockChecksum::of(&bytes).strong == expected {
                found[index] = Some(offset);
                break;
            }
        }
        Ok(())
    }

    /// 일치하지 않아 원격에서 받아야 하는 구간 (인접 블록은 병합)
    pub fn missing_ranges(&self, matches: &[BlockMatch]) -> Vec<Range> {
        let mut present = vec![false; self.record.block_count()];
        for m in matches {
            present[m.block_index] = true;
        }

        let mut missing: Vec<Range> = Vec::new();
        for (index, &ok) in present.iter().enumerate() {
            if ok {
                continue;
            }
            let range = self.record.block_range(index);
            match missing.last_mut() {
                Some(last) if last.end() == range.start => last.length += range.length,
                _ => missing.push(range),
            }
        }
        missing
    }
}

/// 버퍼를 최소 `target` 바이트까지 채움. EOF 에 닿으면 true.
fn fill<R: Read>(reader: &mut R, buf: &mut Vec<u8>, target: usize) -> std::io::Result<bool> {
    let mut chunk = [0u8; 64 * 1024];
    while buf.len() < target {
        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(true);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(false)
}
