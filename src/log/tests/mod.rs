pub mod helpers;
mod tests_cursor;
mod tests_recovery;
