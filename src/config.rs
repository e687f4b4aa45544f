// Persistent configuration: integer settings stored as key=value lines in
// garnet64.ini next to the working directory. Unknown keys are ignored and
// missing keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    /// Pace frame presentation to ~60 Hz in the frontend.
    pub fps_limiter: i32,
    /// Emulate the 8MB expansion pak instead of 4MB of RDRAM.
    pub expansion_pak: i32,
    /// Run RDP commands on a worker thread.
    pub threaded_rdp: i32,
    /// Bilinear-filter textures when the guest asks for filtering.
    pub tex_filter: i32,

    path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fps_limiter: 1,
            expansion_pak: 1,
            threaded_rdp: 0,
            tex_filter: 1,
            path: PathBuf::from("garnet64.ini"),
        }
    }
}

impl Config {
    /// Load settings from the given file, or return defaults if it doesn't
    /// exist or can't be read.
    pub fn load(path: &Path) -> Self {
        let mut config = Config { path: path.to_path_buf(), ..Config::default() };

        let Ok(content) = fs::read_to_string(path) else { return config };
        for line in content.lines() {
            let Some((name, value)) = line.split_once('=') else { continue };
            let Ok(value) = value.trim().parse::<i32>() else { continue };
            match name.trim() {
                "fpsLimiter" => config.fps_limiter = value,
                "expansionPak" => config.expansion_pak = value,
                "threadedRdp" => config.threaded_rdp = value,
                "texFilter" => config.tex_filter = value,
                _ => {}
            }
        }
        config
    }

    /// Write each value to a line in the settings file.
    pub fn save(&self) {
        let content = format!(
            "fpsLimiter={}\nexpansionPak={}\nthreadedRdp={}\ntexFilter={}\n",
            self.fps_limiter, self.expansion_pak, self.threaded_rdp, self.tex_filter,
        );
        if let Err(error) = fs::write(&self.path, content) {
            log::warn!("Cannot save settings: {}", error);
        }
    }
}
