pub mod bars;
pub mod pool;
pub mod ticks;
