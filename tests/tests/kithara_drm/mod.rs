mod license;
mod lifecycle;
mod persistence;
mod sessions;
