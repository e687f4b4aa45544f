//! The system handle the frontend drives: boot/stop lifecycle, the emulator
//! and save-flush threads, and the shared state that crosses between the
//! emulator, the audio callback, and the window loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};

use crate::config::Config;
use crate::n64::ai::AudioOutput;
use crate::n64::pif::InputEvent;
use crate::n64::vi::{FrameQueue, Framebuffer};
use crate::n64::Console;

/// The cartridge save, guarded by one mutex shared between the emulator and
/// the flush thread. The size of the data selects the backend: 0 (none),
/// 512 or 2048 (EEPROM), 32K (SRAM), or 128K (FLASH).
pub struct SaveFile {
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub dirty: bool,
}

impl SaveFile {
    pub fn empty() -> Self {
        SaveFile { path: PathBuf::new(), data: Vec::new(), dirty: false }
    }

    /// Write the save file back to disk if the data changed.
    pub fn flush(&mut self) {
        if !self.dirty || self.path.as_os_str().is_empty() {
            return;
        }
        match fs::write(&self.path, &self.data) {
            Ok(()) => {
                log::info!("Writing save file to disk");
                self.dirty = false;
            }
            Err(error) => log::warn!("Failed to write save file: {}", error),
        }
    }
}

pub struct System {
    config: Config,
    running: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    save: Arc<Mutex<SaveFile>>,
    frames: Arc<FrameQueue>,
    audio: Arc<AudioOutput>,
    input_tx: Option<Sender<InputEvent>>,
    emu_thread: Option<JoinHandle<Console>>,
    save_thread: Option<JoinHandle<()>>,
}

impl System {
    pub fn new(config: Config) -> Self {
        System {
            config,
            running: Arc::new(AtomicBool::new(false)),
            fps: Arc::new(AtomicU32::new(0)),
            save: Arc::new(Mutex::new(SaveFile::empty())),
            frames: Arc::new(FrameQueue::default()),
            audio: Arc::new(AudioOutput::default()),
            input_tx: None,
            emu_thread: None,
            save_thread: None,
        }
    }

    /// Load a ROM and its sibling save, build a fresh console, and start the
    /// emulator and save threads. Returns false if the ROM can't be read.
    pub fn boot_rom(&mut self, path: &Path) -> bool {
        let Ok(rom) = fs::read(path) else { return false };

        // Ensure the emulator is stopped
        self.stop();

        // The save lives next to the ROM; its current size on disk picks the
        // save type, and no file means no save until one is created
        let save_path = path.with_extension("sav");
        let save_data = fs::read(&save_path).unwrap_or_default();
        *self.save.lock().unwrap() =
            SaveFile { path: save_path, data: save_data, dirty: false };

        // The boot ROM comes from a pif_rom file next to the game ROM or in
        // the working directory
        let pif_rom = path
            .with_file_name("pif_rom.bin")
            .exists()
            .then(|| fs::read(path.with_file_name("pif_rom.bin")).ok())
            .flatten()
            .or_else(|| fs::read("pif_rom.bin").ok())
            .unwrap_or_else(|| {
                log::warn!("No pif_rom.bin found; booting with empty PIF ROM");
                Vec::new()
            });

        let (input_tx, input_rx) = unbounded();
        self.input_tx = Some(input_tx);
        self.running.store(true, Ordering::Relaxed);

        let mut console = Console::new(
            rom,
            pif_rom,
            Arc::clone(&self.save),
            Arc::clone(&self.frames),
            Arc::clone(&self.audio),
            input_rx,
            Arc::clone(&self.running),
            Arc::clone(&self.fps),
            &self.config,
        );

        self.emu_thread = Some(
            thread::Builder::new()
                .name("emulator".into())
                .spawn(move || {
                    console.run();
                    console
                })
                .unwrap(),
        );

        // The save thread wakes every few seconds to flush dirty save data
        let running = Arc::clone(&self.running);
        let save = Arc::clone(&self.save);
        self.save_thread = Some(
            thread::Builder::new()
                .name("save".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        thread::park_timeout(Duration::from_secs(3));
                        save.lock().unwrap().flush();
                    }
                })
                .unwrap(),
        );

        true
    }

    /// Stop emulation: clear the running flag, join the emulator, the saver,
    /// and the RDP worker in that order, and flush the save.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);

        if let Some(emu) = self.emu_thread.take() {
            if let Ok(mut console) = emu.join() {
                console.rdp_finish_worker();
            }
        }
        if let Some(saver) = self.save_thread.take() {
            saver.thread().unpark();
            let _ = saver.join();
        }
        self.save.lock().unwrap().flush();
        self.input_tx = None;
    }

    /// Resize the save, preserving what fits and padding the tail with 0xFF,
    /// then flush it to disk immediately.
    pub fn resize_save(&self, new_size: usize) {
        let mut save = self.save.lock().unwrap();
        save.data.resize(new_size, 0xFF);
        save.dirty = true;
        save.flush();
    }

    pub fn take_framebuffer(&self) -> Option<Framebuffer> {
        self.frames.take()
    }

    pub fn audio(&self) -> Arc<AudioOutput> {
        Arc::clone(&self.audio)
    }

    pub fn input(&self) -> Option<Sender<InputEvent>> {
        self.input_tx.clone()
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    pub fn save_size(&self) -> usize {
        self.save.lock().unwrap().data.len()
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_save_pads_and_preserves() {
        let system = System::new(Config::default());
        {
            let mut save = system.save.lock().unwrap();
            save.data = vec![0x11, 0x22, 0x33, 0x44];
        }
        system.resize_save(8);
        {
            let save = system.save.lock().unwrap();
            assert_eq!(save.data, vec![0x11, 0x22, 0x33, 0x44, 0xFF, 0xFF, 0xFF, 0xFF]);
        }
        system.resize_save(2);
        assert_eq!(system.save.lock().unwrap().data, vec![0x11, 0x22]);

        // Resizing to the same size twice yields identical bytes
        system.resize_save(2);
        assert_eq!(system.save.lock().unwrap().data, vec![0x11, 0x22]);
    }

    #[test]
    fn boot_fails_cleanly_for_a_missing_rom() {
        let mut system = System::new(Config::default());
        assert!(!system.boot_rom(Path::new("/nonexistent/rom.z64")));
        assert!(!system.running());
    }
}
