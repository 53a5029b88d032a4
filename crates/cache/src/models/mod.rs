mod entry;
pub(crate) mod row;

pub use self::entry::{ContentEntry, Root};
pub(crate) use self::row::EntryRow;
