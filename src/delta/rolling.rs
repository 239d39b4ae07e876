//! rsync 방식 rolling checksum (Adler-32 변형)
//!
//! 윈도우를 한 바이트 밀 때 O(1) 로 갱신된다.

const MOD: u32 = 1 << 16;

/// 고정 길이 윈도우에 대한 rolling checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    /// 윈도우 전체로 초기화
    pub fn new(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
        }
        Self {
            a: a % MOD,
            b: b % MOD,
            len,
        }
    }

    /// 윈도우를 한 바이트 이동 (`out` 제거, `input` 추가)
    pub fn roll(&mut self, out: u8, input: u8) {
        let out = out as u32;
        let input = input as u32;
        self.a = (self.a + MOD - out + input) % MOD;
        // b' = b - len*out + a'
        let sub = (self.len.wrapping_mul(out)) % MOD;
        self.b = (self.b + MOD - sub + self.a) % MOD;
    }

    pub fn value(&self) -> u32 {
        self.a | (self.b << 16)
    }
}

/// 블록 하나의 rolling checksum 값
pub fn checksum(block: &[u8]) -> u32 {
    RollingChecksum::new(block).value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_matches_recompute() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i * 31 % 251) as u8).collect();
        let window = 64;

        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.value(),
                checksum(&data[start..start + window]),
                "offset {start}"
            );
        }
    }

    #[test]
    fn test_different_blocks_differ() {
        assert_ne!(checksum(b"abcdefgh"), checksum(b"abcdefgi"));
        assert_ne!(checksum(b"abcdefgh"), checksum(b"bacdefgh"));
    }
}
