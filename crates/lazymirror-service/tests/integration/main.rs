mod concurrency;
mod mirror;
mod utils;
