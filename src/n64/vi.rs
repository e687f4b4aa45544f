//! Video interface: decodes the guest framebuffer to host ARGB frames on a
//! 60 Hz task and queues at most two of them for the frontend, which pops
//! through an atomic ready flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{Console, Task, CPU_HZ};

pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u32>,
}

#[derive(Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Framebuffer>>,
    ready: AtomicBool,
}

impl FrameQueue {
    /// Non-blocking pop of the next decoded frame, if one is ready.
    pub fn take(&self) -> Option<Framebuffer> {
        if !self.ready.load(Ordering::Acquire) {
            return None;
        }

        let mut frames = self.frames.lock().unwrap();
        let frame = frames.pop_front();
        self.ready.store(!frames.is_empty(), Ordering::Release);
        frame
    }
}

pub struct Vi {
    control: u32,
    origin: u32,
    width: u32,
    y_scale: u32,
}

impl Vi {
    pub fn new() -> Self {
        Vi { control: 0, origin: 0, width: 0, y_scale: 0 }
    }

    pub fn read(&self, address: u32) -> u32 {
        log::warn!("Unknown VI register read: 0x{:X}", address);
        0
    }
}

impl Console {
    pub(crate) fn vi_reset(&mut self) {
        self.vi = Vi::new();

        // Schedule the first frame to be drawn
        self.schedule(Task::DrawFrame, ((CPU_HZ / 2 / 60) * 2) as u32);
    }

    pub(crate) fn vi_write(&mut self, address: u32, value: u32) {
        match address {
            // Only the pixel type bits are honored so far
            0x440_0000 => self.vi.control = value & 0x1_FBFF, // VI_CONTROL

            // The framebuffer address is always kept kseg1-aliased
            0x440_0004 => self.vi.origin = 0x8000_0000 | (value & 0xFF_FFFF), // VI_ORIGIN

            0x440_0008 => self.vi.width = value & 0xFFF, // VI_WIDTH

            0x440_0010 => self.mi_clear_interrupt(3), // VI_V_CURRENT acknowledges

            0x440_0034 => self.vi.y_scale = value & 0xFFF_0FFF, // VI_Y_SCALE

            _ => log::warn!("Unknown VI register write: 0x{:X}", address),
        }
    }

    /// Decode and queue a frame, raise the vblank interrupt, and reschedule.
    pub(crate) fn vi_draw_frame(&mut self) {
        // Route any frontend input edges to the PIF at frame cadence
        while let Ok(event) = self.input.try_recv() {
            self.pif.apply(event);
        }

        // Allow up to 2 queued framebuffers to preserve pacing when the
        // emulator runs ahead
        if self.frames.frames.lock().unwrap().len() < 2 {
            let width = self.vi.width;
            let height = (self.vi.y_scale & 0xFFF) * 240 / 1024;
            let size = (width * height) as usize;
            let mut data = vec![0u32; size];

            match self.vi.control & 0x3 {
                0x3 => {
                    // Translate pixels from RGBA8888 to host ARGB8888
                    for (i, pixel) in data.iter_mut().enumerate() {
                        let color = self.read::<u32>(self.vi.origin + (i as u32) * 4);
                        let r = (color >> 24) & 0xFF;
                        let g = (color >> 16) & 0xFF;
                        let b = (color >> 8) & 0xFF;
                        *pixel = (0xFF << 24) | (b << 16) | (g << 8) | r;
                    }
                }

                0x2 => {
                    // Translate pixels from RGBA5551 to host ARGB8888
                    for (i, pixel) in data.iter_mut().enumerate() {
                        let color = self.read::<u16>(self.vi.origin + (i as u32) * 2) as u32;
                        let r = ((color >> 11) & 0x1F) * 255 / 31;
                        let g = ((color >> 6) & 0x1F) * 255 / 31;
                        let b = ((color >> 1) & 0x1F) * 255 / 31;
                        *pixel = (0xFF << 24) | (b << 16) | (g << 8) | r;
                    }
                }

                // Blanked: don't show anything
                _ => {}
            }

            let mut frames = self.frames.frames.lock().unwrap();
            frames.push_back(Framebuffer { width, height, data });
            self.frames.ready.store(true, Ordering::Release);
        }

        // Finish the frame and request a VI interrupt
        self.mi_set_interrupt(3);

        // Schedule the next frame to be drawn
        self.schedule(Task::DrawFrame, ((CPU_HZ / 2 / 60) * 2) as u32);
        self.count_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_console;

    #[test]
    fn frames_decode_rgba5551_and_queue_at_most_two() {
        let mut console = test_console();
        console.vi_write(0x440_0000, 0x2); // 16-bit pixels
        console.vi_write(0x440_0004, 0x10_0000);
        console.vi_write(0x440_0008, 4);
        console.vi_write(0x440_0034, 18); // Height 18 * 240 / 1024 = 4

        // Solid red: r=31, a=1
        for i in 0..16 {
            console.write::<u16>(0xA010_0000 + i * 2, 0xF801);
        }

        for _ in 0..3 {
            console.vi_draw_frame();
        }
        assert_eq!(console.frames.frames.lock().unwrap().len(), 2);
        assert_ne!(console.mi.interrupt & (1 << 3), 0);

        let frame = console.frames.take().unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        assert!(frame.data.iter().all(|&pixel| pixel == 0xFF00_00FF));
    }

    #[test]
    fn rgba32_frames_keep_full_precision() {
        let mut console = test_console();
        console.vi_write(0x440_0000, 0x3);
        console.vi_write(0x440_0004, 0x10_0000);
        console.vi_write(0x440_0008, 2);
        console.vi_write(0x440_0034, 9); // Height 9 * 240 / 1024 = 2

        console.write::<u32>(0xA010_0000, 0x1234_56FF);
        console.vi_draw_frame();

        let frame = console.frames.take().unwrap();
        assert_eq!(frame.data[0], 0xFF56_3412);
    }

    #[test]
    fn take_returns_nothing_when_idle() {
        let console = test_console();
        assert!(console.frames.take().is_none());
    }
}
