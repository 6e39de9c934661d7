pub use proptest::prelude::*;
