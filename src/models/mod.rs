pub mod vol_lstm;
