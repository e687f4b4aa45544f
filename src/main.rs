// Desktop frontend: a bare frame window with keyboard input and a cpal
// audio stream, driving the emulator core. All of the interesting work
// happens on the emulator thread; this loop just presents frames, forwards
// input edges, and keeps the audio callback fed.

mod config;
mod core;
mod n64;

use std::collections::VecDeque;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use minifb::{Key, KeyRepeat, Window, WindowOptions};

use crate::config::Config;
use crate::core::System;
use crate::n64::ai::{AudioOutput, SAMPLE_COUNT};
use crate::n64::pif::InputEvent;

// Button bindings in PIF order: A, B, Z, Start, D-pad, L, R, C-buttons
const KEY_BINDS: [Key; 14] = [
    Key::X,
    Key::C,
    Key::Z,
    Key::Enter,
    Key::Up,
    Key::Down,
    Key::Left,
    Key::Right,
    Key::A,
    Key::S,
    Key::I,
    Key::K,
    Key::J,
    Key::L,
];

fn main() {
    env_logger::init();

    let Some(rom_path) = std::env::args().nth(1) else {
        eprintln!("usage: garnet64 <rom.z64>");
        process::exit(2);
    };

    let config_path = Path::new("garnet64.ini");
    let config = Config::load(config_path);
    if !config_path.exists() {
        config.save();
    }

    let mut system = System::new(config.clone());
    if !system.boot_rom(Path::new(&rom_path)) {
        log::error!("Failed to open ROM: {}", rom_path);
        process::exit(1);
    }

    // The stream must stay alive for the duration; without a device, a drain
    // thread keeps the audio pacing loop moving
    let _stream = match start_audio(system.audio()) {
        Some(stream) => Some(stream),
        None => {
            log::warn!("No audio output available; draining audio silently");
            let audio = system.audio();
            thread::spawn(move || {
                let mut sink = [0u32; SAMPLE_COUNT];
                loop {
                    audio.fill_buffer(&mut sink);
                    thread::sleep(Duration::from_millis(21));
                }
            });
            None
        }
    };

    let mut window = Window::new(
        "Garnet64",
        640,
        480,
        WindowOptions { resize: true, ..WindowOptions::default() },
    )
    .unwrap_or_else(|error| {
        log::error!("Failed to open window: {}", error);
        process::exit(1);
    });
    window.set_target_fps(if config.fps_limiter != 0 { 60 } else { 0 });

    let input = system.input().expect("emulator should be running");
    let mut buffer: Vec<u32> = vec![0; 640 * 480];
    let mut size = (640, 480);
    let mut stick = (0i8, 0i8);
    let mut title_time = Instant::now();

    while window.is_open() && !window.is_key_down(Key::Escape) {
        // Forward button edges to the controller
        for (index, &key) in KEY_BINDS.iter().enumerate() {
            if window.is_key_pressed(key, KeyRepeat::No) {
                let _ = input.send(InputEvent::Press(index));
            }
            if window.is_key_released(key) {
                let _ = input.send(InputEvent::Release(index));
            }
        }

        // The stick is emulated with held keys
        let axis = |negative, positive| {
            match (window.is_key_down(negative), window.is_key_down(positive)) {
                (true, false) => -80i8,
                (false, true) => 80,
                _ => 0,
            }
        };
        let next = (axis(Key::D, Key::G), axis(Key::F, Key::R));
        if next != stick {
            stick = next;
            let _ = input.send(InputEvent::Stick(stick.0, stick.1));
        }

        if let Some(frame) = system.take_framebuffer() {
            if frame.width > 0 && frame.height > 0 {
                // The core hands out RGBA in memory order; minifb wants 0RGB
                buffer.resize((frame.width * frame.height) as usize, 0);
                for (out, &pixel) in buffer.iter_mut().zip(frame.data.iter()) {
                    let r = pixel & 0xFF;
                    let g = (pixel >> 8) & 0xFF;
                    let b = (pixel >> 16) & 0xFF;
                    *out = (r << 16) | (g << 8) | b;
                }
                size = (frame.width as usize, frame.height as usize);
            }
        }
        window.update_with_buffer(&buffer, size.0, size.1).unwrap_or_else(|error| {
            log::warn!("Window update failed: {}", error);
        });

        if title_time.elapsed().as_secs() >= 1 {
            window.set_title(&format!("Garnet64 - {} FPS", system.fps()));
            title_time = Instant::now();
        }
    }

    system.stop();
}

/// Open the default output device as 16-bit stereo at 48kHz and service it
/// from the AI output slot, bridging mismatched callback sizes with a small
/// carry-over queue.
fn start_audio(audio: Arc<AudioOutput>) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device()?;
    let stream_config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(48000),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: VecDeque<i16> = VecDeque::new();
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    if pending.is_empty() {
                        let mut block = [0u32; SAMPLE_COUNT];
                        audio.fill_buffer(&mut block);
                        for value in block {
                            pending.push_back(value as i16); // Left
                            pending.push_back((value >> 16) as i16); // Right
                        }
                    }
                    *sample = pending.pop_front().unwrap_or(0);
                }
            },
            |error| log::error!("Audio stream error: {}", error),
            None,
        )
        .ok()?;
    stream.play().ok()?;
    Some(stream)
}
