//! 字节序编解码层
//!
//! 同一个驱动要挂载不同字节序的 UFS 卷, 每个磁盘整数字段在读写时都要经过这里.
//! 选择在挂载时确定一次, 之后在整个挂载期内不可变.
//!
//! 两套接口:
//! - "raw" 接口: 把存储的字节按本机序解释为整数 (raw), 然后根据 swab 标志决定是否交换,
//!   计数器的原地加减 (`decode_add*`) 走这条路;
//! - 显式接口: 直接指定小端/大端从字节切片中取值/写值, 字段解析走这条路.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ByteOrder::Little => "little-endian",
            ByteOrder::Big => "big-endian",
        }
    }
}

/// 每个挂载一份的编解码器. 这一层不会失败.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Codec {
    order: ByteOrder,
    /// 存储序与本机序不同
    swab: bool,
}

impl Codec {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            swab: order != ByteOrder::host(),
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn swab(&self) -> bool {
        self.swab
    }

    pub fn decode16(&self, raw: u16) -> u16 {
        if self.swab {
            raw.swap_bytes()
        } else {
            raw
        }
    }

    pub fn decode32(&self, raw: u32) -> u32 {
        if self.swab {
            raw.swap_bytes()
        } else {
            raw
        }
    }

    pub fn decode64(&self, raw: u64) -> u64 {
        if self.swab {
            raw.swap_bytes()
        } else {
            raw
        }
    }

    // 交换是对合的, 编码与解码相同
    pub fn encode16(&self, value: u16) -> u16 {
        self.decode16(value)
    }

    pub fn encode32(&self, value: u32) -> u32 {
        self.decode32(value)
    }

    pub fn encode64(&self, value: u64) -> u64 {
        self.decode64(value)
    }

    pub fn decode_add16(&self, raw: u16, delta: i16) -> u16 {
        self.encode16(self.decode16(raw).wrapping_add(delta as u16))
    }

    pub fn decode_add32(&self, raw: u32, delta: i32) -> u32 {
        self.encode32(self.decode32(raw).wrapping_add(delta as u32))
    }

    pub fn decode_add64(&self, raw: u64, delta: i64) -> u64 {
        self.encode64(self.decode64(raw).wrapping_add(delta as u64))
    }

    pub fn get_u16(&self, buf: &[u8], off: usize) -> u16 {
        let bytes = [buf[off], buf[off + 1]];
        match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    pub fn get_u32(&self, buf: &[u8], off: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[off..off + 4]);
        match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn get_u64(&self, buf: &[u8], off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[off..off + 8]);
        match self.order {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }

    pub fn put_u16(&self, buf: &mut [u8], off: usize, value: u16) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[off..off + 2].copy_from_slice(&bytes);
    }

    pub fn put_u32(&self, buf: &mut [u8], off: usize, value: u32) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[off..off + 4].copy_from_slice(&bytes);
    }

    pub fn put_u64(&self, buf: &mut [u8], off: usize, value: u64) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[off..off + 8].copy_from_slice(&bytes);
    }

    /// 就地对一个 32 位计数器做 "解码-加-编码"
    pub fn add_u32(&self, buf: &mut [u8], off: usize, delta: i32) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[off..off + 4]);
        let updated = self.decode_add32(u32::from_ne_bytes(raw), delta);
        buf[off..off + 4].copy_from_slice(&updated.to_ne_bytes());
        self.decode32(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: [ByteOrder; 2] = [ByteOrder::Little, ByteOrder::Big];

    #[test]
    fn raw_round_trip_all_widths() {
        for order in ORDERS {
            let c = Codec::new(order);
            for x in [0u16, 1, 0x1234, u16::MAX] {
                assert_eq!(c.decode16(c.encode16(x)), x);
            }
            for x in [0u32, 0x0001_1954, 0xdead_beef, u32::MAX] {
                assert_eq!(c.decode32(c.encode32(x)), x);
            }
            for x in [0u64, 0x0102_0304_0506_0708, u64::MAX] {
                assert_eq!(c.decode64(c.encode64(x)), x);
            }
        }
    }

    #[test]
    fn raw_and_explicit_views_agree() {
        for order in ORDERS {
            let c = Codec::new(order);
            let mut buf = [0u8; 16];
            c.put_u32(&mut buf, 4, 0x0001_1954);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[4..8]);
            assert_eq!(c.decode32(u32::from_ne_bytes(raw)), 0x0001_1954);
            c.put_u64(&mut buf, 8, 0x1122_3344_5566_7788);
            assert_eq!(c.get_u64(&buf, 8), 0x1122_3344_5566_7788);
            c.put_u16(&mut buf, 0, 0xbeef);
            assert_eq!(c.get_u16(&buf, 0), 0xbeef);
        }
    }

    #[test]
    fn stored_layout_matches_order() {
        let mut buf = [0u8; 4];
        Codec::new(ByteOrder::Big).put_u32(&mut buf, 0, 0x0001_1954);
        assert_eq!(buf, [0x00, 0x01, 0x19, 0x54]);
        Codec::new(ByteOrder::Little).put_u32(&mut buf, 0, 0x0001_1954);
        assert_eq!(buf, [0x54, 0x19, 0x01, 0x00]);
    }

    #[test]
    fn decode_add_updates_in_place() {
        for order in ORDERS {
            let c = Codec::new(order);
            let mut buf = [0u8; 4];
            c.put_u32(&mut buf, 0, 10);
            assert_eq!(c.add_u32(&mut buf, 0, -3), 7);
            assert_eq!(c.get_u32(&buf, 0), 7);
            assert_eq!(c.decode16(c.decode_add16(c.encode16(5), 2)), 7);
            assert_eq!(c.decode64(c.decode_add64(c.encode64(5), -5)), 0);
        }
    }
}
