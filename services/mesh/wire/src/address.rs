//! Mesh address ranges.
//!
//! Addresses are plain `u16` values. The helpers here classify them the way
//! the network layer needs: unicast sources, group and virtual destinations,
//! the fixed group block and the reserved range that is never accepted.

/// The unassigned address
pub const UNASSIGNED: u16 = 0x0000;

/// All-proxies fixed group
pub const ALL_PROXIES: u16 = 0xfffc;
/// All-friends fixed group
pub const ALL_FRIENDS: u16 = 0xfffd;
/// All-relays fixed group
pub const ALL_RELAYS: u16 = 0xfffe;
/// All-nodes fixed group
pub const ALL_NODES: u16 = 0xffff;

/// First address of the reserved-for-future-use group block
pub const RFU_START: u16 = 0xff00;
/// Last address of the reserved-for-future-use group block
pub const RFU_END: u16 = 0xfffb;

/// Unicast addresses are 0x0001..=0x7fff
pub fn is_unicast(addr: u16) -> bool {
    addr != UNASSIGNED && addr & 0x8000 == 0
}

/// Virtual addresses are 0x8000..=0xbfff
pub fn is_virtual(addr: u16) -> bool {
    addr & 0xc000 == 0x8000
}

/// Group addresses are 0xc000..=0xffff (including fixed groups)
pub fn is_group(addr: u16) -> bool {
    addr & 0xc000 == 0xc000
}

/// Reserved group addresses that must never be used as a destination
pub fn is_rfu(addr: u16) -> bool {
    (RFU_START..=RFU_END).contains(&addr)
}

/// One of the four fixed group addresses
pub fn is_fixed_group(addr: u16) -> bool {
    addr >= ALL_PROXIES
}

/// Whether `addr` falls inside the element range `[base, base + count)`
pub fn in_element_range(addr: u16, base: u16, count: u16) -> bool {
    is_unicast(addr) && addr >= base && (addr as u32) < base as u32 + count as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classes() {
        assert!(!is_unicast(UNASSIGNED));
        assert!(is_unicast(0x0001));
        assert!(is_unicast(0x7fff));
        assert!(!is_unicast(0x8000));
        assert!(is_virtual(0x8000));
        assert!(is_virtual(0xbfff));
        assert!(is_group(0xc000));
        assert!(is_group(ALL_NODES));
        assert!(!is_group(0xbfff));
    }

    #[test]
    fn test_rfu_and_fixed() {
        assert!(is_rfu(0xff00));
        assert!(is_rfu(0xfffb));
        assert!(!is_rfu(ALL_PROXIES));
        assert!(is_fixed_group(ALL_PROXIES));
        assert!(is_fixed_group(ALL_NODES));
        assert!(!is_fixed_group(0xfffb));
    }

    #[test]
    fn test_element_range() {
        assert!(in_element_range(0x0010, 0x0010, 3));
        assert!(in_element_range(0x0012, 0x0010, 3));
        assert!(!in_element_range(0x0013, 0x0010, 3));
        assert!(!in_element_range(0x000f, 0x0010, 3));
        assert!(in_element_range(0x7fff, 0x7fff, 1));
    }
}
