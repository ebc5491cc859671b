pub mod nand;
pub mod ubi;
pub mod util;
