use std::fmt::{Display, Formatter};
use std::ops::{Index, IndexMut};

/// The cryptographic phase a packet belongs to. Each epoch has its own packet
///  number space: numbers are assigned and acknowledged independently per epoch.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Epoch {
    /// first handshake flight
    Initial,
    /// intermediate handshake
    Handshake,
    /// post-handshake application data
    Application,
}

impl Epoch {
    pub const ALL: [Epoch; 3] = [Epoch::Initial, Epoch::Handshake, Epoch::Application];
    pub const COUNT: usize = Self::ALL.len();

    pub fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Epoch::Initial => write!(f, "I"),
            Epoch::Handshake => write!(f, "H"),
            Epoch::Application => write!(f, "A"),
        }
    }
}

/// Fixed-size per-epoch storage, indexed by [Epoch]. The epoch set is closed,
///  so this is an array rather than a map.
#[derive(Debug)]
pub struct EpochMap<T>([T; Epoch::COUNT]);

impl<T> EpochMap<T> {
    pub fn new(mut init: impl FnMut(Epoch) -> T) -> EpochMap<T> {
        EpochMap(Epoch::ALL.map(&mut init))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Epoch, &T)> {
        Epoch::ALL.iter().map(move |&epoch| (epoch, &self.0[epoch.ordinal()]))
    }
}

impl<T: Default> Default for EpochMap<T> {
    fn default() -> Self {
        EpochMap::new(|_| T::default())
    }
}

impl<T> Index<Epoch> for EpochMap<T> {
    type Output = T;

    fn index(&self, epoch: Epoch) -> &T {
        &self.0[epoch.ordinal()]
    }
}

impl<T> IndexMut<Epoch> for EpochMap<T> {
    fn index_mut(&mut self, epoch: Epoch) -> &mut T {
        &mut self.0[epoch.ordinal()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Epoch::Initial, 0)]
    #[case(Epoch::Handshake, 1)]
    #[case(Epoch::Application, 2)]
    fn test_ordinal(#[case] epoch: Epoch, #[case] expected: usize) {
        assert_eq!(epoch.ordinal(), expected);
        assert_eq!(Epoch::ALL[expected], epoch);
    }

    #[test]
    fn test_epoch_map_indexing() {
        let mut map: EpochMap<u64> = EpochMap::default();
        assert_eq!(map[Epoch::Application], 0);

        map[Epoch::Application] = 17;
        map[Epoch::Initial] = 3;

        assert_eq!(map[Epoch::Initial], 3);
        assert_eq!(map[Epoch::Handshake], 0);
        assert_eq!(map[Epoch::Application], 17);
    }

    #[test]
    fn test_epoch_map_iter() {
        let map = EpochMap::new(|epoch| epoch.ordinal() * 10);
        let collected: Vec<_> = map.iter().map(|(e, &v)| (e, v)).collect();
        assert_eq!(collected, vec![
            (Epoch::Initial, 0),
            (Epoch::Handshake, 10),
            (Epoch::Application, 20),
        ]);
    }
}
