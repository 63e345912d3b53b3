//! Hard input limits. These guard memory and journal size; business rules live in `config::Policy`.

pub const MAX_NAME_LEN: usize = 150;
pub const MAX_PURPOSE_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_SPACES: usize = 10_000;
pub const MAX_ITEMS: usize = 50_000;
pub const MAX_WINDOWS_PER_SPACE: usize = 64;
pub const MAX_BLOCKS_PER_SPACE: usize = 1_000;
pub const MAX_CAPACITY: u32 = 100_000;
pub const MAX_ITEM_QTY: u32 = 1_000_000;
pub const MAX_LINKS_PER_ITEM: usize = 100_000;
pub const MAX_LIST_LIMIT: usize = 500;
