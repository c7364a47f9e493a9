pub mod headless;
pub mod vk;
