mod check;
mod serve;

pub use check::{CheckArgs, run_check};
pub use serve::{ServeArgs, run_serve};
