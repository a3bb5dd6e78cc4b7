pub(crate) const B: u64 = 1;
pub(crate) const KIB: u64 = 1024 * B;
pub(crate) const MIB: u64 = 1024 * KIB;
