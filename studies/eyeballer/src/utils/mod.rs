pub mod display;
pub mod images;
pub mod logging;
pub mod loss;
