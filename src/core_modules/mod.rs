pub mod cascade_detector;
pub mod classifier_detector;
pub mod detector;
pub mod fusion;
pub mod head_pose;
pub mod landmark_detector;
pub mod landmarks;
pub mod metrics;
pub mod providers;
pub mod rolling_window;
pub mod verdict;
