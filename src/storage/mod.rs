pub mod key_cache;
