/// contains the id of a logical cpu core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoreId(pub u16);

impl CoreId {
    /// The id as an index into per-core tables
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}
