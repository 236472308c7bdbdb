pub mod block;
pub mod footer;
pub mod reader;
pub mod writer;

pub use block::{Block, BlockBuilder, BlockEntry, BlockIter};
pub use footer::{Footer, CURRENT_VERSION, FOOTER_MAGIC, FOOTER_SIZE};
pub use reader::{SSTableIter, SSTableReader};
pub use writer::SSTableWriter;
