pub mod helpers;
mod tests_cn_index_db;
mod tests_environment;
