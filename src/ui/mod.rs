pub mod icons;
pub mod live;

pub use live::LiveDisplay;
