pub mod putback;
