use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The traffic classes that outgoing bandwidth is shaped by. Every outgoing packet is tagged with
///  exactly one category when it is enqueued.
///
/// `State` is a logical sub-allocation of `Task`: the viewer negotiates a single task rate, part of
///  which is reserved for avatar and object state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketCategory {
    Resend = 0,
    Land = 1,
    Wind = 2,
    Cloud = 3,
    Task = 4,
    Texture = 5,
    Asset = 6,
    State = 7,
}

impl PacketCategory {
    pub const COUNT: usize = 8;

    /// The number of categories that are visible on the wire, i.e. in throttle negotiation
    ///  (`State` is folded into `Task`)
    pub const WIRE_COUNT: usize = 7;

    pub const ALL: [PacketCategory; PacketCategory::COUNT] = [
        PacketCategory::Resend,
        PacketCategory::Land,
        PacketCategory::Wind,
        PacketCategory::Cloud,
        PacketCategory::Task,
        PacketCategory::Texture,
        PacketCategory::Asset,
        PacketCategory::State,
    ];

    pub fn index(self) -> usize {
        u8::from(self) as usize
    }

    pub fn from_index(index: usize) -> Option<PacketCategory> {
        u8::try_from(index).ok()
            .and_then(|i| PacketCategory::try_from(i).ok())
    }

    pub fn flag(self) -> CategoryFlags {
        CategoryFlags::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    /// A set of [PacketCategory] values, e.g. the categories whose queues ran empty during a
    ///  dequeue pass
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CategoryFlags: u8 {
        const RESEND = 1 << 0;
        const LAND = 1 << 1;
        const WIND = 1 << 2;
        const CLOUD = 1 << 3;
        const TASK = 1 << 4;
        const TEXTURE = 1 << 5;
        const ASSET = 1 << 6;
        const STATE = 1 << 7;
    }
}

impl CategoryFlags {
    pub fn categories(self) -> impl Iterator<Item = PacketCategory> {
        PacketCategory::ALL
            .into_iter()
            .filter(move |c| self.contains(c.flag()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::resend(PacketCategory::Resend, 0, CategoryFlags::RESEND)]
    #[case::land(PacketCategory::Land, 1, CategoryFlags::LAND)]
    #[case::task(PacketCategory::Task, 4, CategoryFlags::TASK)]
    #[case::state(PacketCategory::State, 7, CategoryFlags::STATE)]
    fn test_index_and_flag(#[case] category: PacketCategory, #[case] index: usize, #[case] flag: CategoryFlags) {
        assert_eq!(category.index(), index);
        assert_eq!(PacketCategory::from_index(index), Some(category));
        assert_eq!(category.flag(), flag);
    }

    #[test]
    fn test_from_index_out_of_range() {
        assert_eq!(PacketCategory::from_index(8), None);
        assert_eq!(PacketCategory::from_index(300), None);
    }

    #[test]
    fn test_flags_categories() {
        let flags = CategoryFlags::WIND | CategoryFlags::ASSET;
        assert_eq!(flags.categories().collect::<Vec<_>>(), vec![PacketCategory::Wind, PacketCategory::Asset]);
    }
}
