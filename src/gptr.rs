//! Global pointers address a byte in some unit's slice of some segment.
//!
//! A [GlobalPtr] is a plain value: every operator returns a new pointer and
//! none of them touch the runtime. Resolving a pointer to memory happens in
//! the segment table (see [Runtime::segment_resolve][crate::Runtime::segment_resolve]).

use serde::{Deserialize, Serialize};

/// Identifier of a team, unique among the teams a unit is a member of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub u16);

impl TeamId {
    /// The root team containing every unit.
    pub const ALL: TeamId = TeamId(0);
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "team{}", self.0)
    }
}

/// Identifier of a segment.
///
/// `-1` is the null segment and `0` the per-unit local pool. Collective
/// segments use positive ids scoped to their team, attached segments use ids
/// `<= -2` scoped to the attaching unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub i16);

impl SegmentId {
    pub const NULL: SegmentId = SegmentId(-1);
    pub const LOCAL: SegmentId = SegmentId(0);

    pub fn is_collective(&self) -> bool {
        self.0 > 0
    }

    pub fn is_attached(&self) -> bool {
        self.0 <= -2
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "seg{}", self.0)
    }
}

/// A `(unit, segment, team, offset, flags)` global address.
///
/// For collective segments `unit` is relative to `team`; for the local pool
/// and attached segments it is a global unit id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalPtr {
    pub unit: u32,
    pub segment: SegmentId,
    pub team: TeamId,
    pub flags: u16,
    pub offset: u64,
}

impl Default for GlobalPtr {
    fn default() -> Self {
        GlobalPtr::NULL
    }
}

impl GlobalPtr {
    pub const NULL: GlobalPtr = GlobalPtr {
        unit: 0,
        segment: SegmentId::NULL,
        team: TeamId::ALL,
        flags: 0,
        offset: 0,
    };

    pub const fn new(unit: usize, segment: SegmentId, team: TeamId, offset: u64) -> GlobalPtr {
        GlobalPtr {
            unit: unit as u32,
            segment,
            team,
            flags: 0,
            offset,
        }
    }

    pub fn is_null(&self) -> bool {
        self.segment == SegmentId::NULL
    }

    pub fn unit(&self) -> usize {
        self.unit as usize
    }

    /// Advance by `n` elements of type `T`.
    pub fn add_elems<T>(self, n: i64) -> GlobalPtr {
        let bytes = n * std::mem::size_of::<T>() as i64;
        GlobalPtr {
            offset: self.offset.wrapping_add_signed(bytes),
            ..self
        }
    }

    /// Offset 0 of the next unit's slice.
    pub fn advance_unit(self) -> GlobalPtr {
        GlobalPtr {
            unit: self.unit + 1,
            offset: 0,
            ..self
        }
    }

    pub fn with_unit(self, unit: usize) -> GlobalPtr {
        GlobalPtr {
            unit: unit as u32,
            ..self
        }
    }

    pub fn with_segment(self, segment: SegmentId) -> GlobalPtr {
        GlobalPtr { segment, ..self }
    }

    pub fn with_offset(self, offset: u64) -> GlobalPtr {
        GlobalPtr { offset, ..self }
    }

    pub fn with_flags(self, flags: u16) -> GlobalPtr {
        GlobalPtr { flags, ..self }
    }
}

impl std::ops::Add<u64> for GlobalPtr {
    type Output = GlobalPtr;
    fn add(self, bytes: u64) -> GlobalPtr {
        GlobalPtr {
            offset: self.offset.wrapping_add(bytes),
            ..self
        }
    }
}

impl std::ops::Sub<u64> for GlobalPtr {
    type Output = GlobalPtr;
    fn sub(self, bytes: u64) -> GlobalPtr {
        GlobalPtr {
            offset: self.offset.wrapping_sub(bytes),
            ..self
        }
    }
}

impl std::fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "gptr(unit={}, {}, {}, offset={:#x}, flags={:#x})",
            self.unit, self.segment, self.team, self.offset, self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GlobalPtr {
        GlobalPtr::new(2, SegmentId(3), TeamId(1), 64)
    }

    #[test]
    fn null_pointer() {
        assert!(GlobalPtr::NULL.is_null());
        assert!(GlobalPtr::default().is_null());
        assert!(!sample().is_null());
        assert!(sample().with_segment(SegmentId::NULL).is_null());
    }

    #[test]
    fn arithmetic_only_touches_offset() {
        let g = sample();
        let h = g + 16;
        assert_eq!(h.offset, 80);
        assert_eq!((h.unit, h.segment, h.team), (g.unit, g.segment, g.team));
        assert_eq!(h - 16, g);
        assert_eq!(g.add_elems::<u64>(3).offset, 64 + 24);
        assert_eq!(g.add_elems::<u32>(-4).offset, 48);
    }

    #[test]
    fn advance_unit_resets_offset() {
        let g = sample().advance_unit();
        assert_eq!(g.unit, 3);
        assert_eq!(g.offset, 0);
        assert_eq!(g.segment, SegmentId(3));
    }

    #[test]
    fn equality_uses_every_field() {
        let g = sample();
        assert_eq!(g, sample());
        assert_ne!(g, g.with_unit(1));
        assert_ne!(g, g.with_segment(SegmentId(4)));
        assert_ne!(g, g.with_flags(1));
        assert_ne!(g, g.with_offset(0));
        assert_ne!(g, GlobalPtr { team: TeamId(2), ..g });
    }

    #[test]
    fn element_offsets_are_invertible() {
        let base = sample().with_offset(0);
        for idx in 0..100i64 {
            let g = base.add_elems::<f64>(idx);
            assert_eq!(g.offset as i64 / std::mem::size_of::<f64>() as i64, idx);
            assert_eq!(g.add_elems::<f64>(-idx), base);
        }
    }

    #[test]
    fn serializes_with_bincode() {
        let g = sample();
        let bytes = bincode::serialize(&g).unwrap();
        let back: GlobalPtr = bincode::deserialize(&bytes).unwrap();
        assert_eq!(g, back);
    }
}
