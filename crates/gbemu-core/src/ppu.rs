use serde::{Deserialize, Serialize};

use crate::bus::{Bus, INT_STAT, INT_VBLANK, IoReg, LatchedReg, ScanlineChange, VRAM_BANK_SIZE};

#[cfg(feature = "ppu-trace")]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*);
    };
}
#[cfg(not(feature = "ppu-trace"))]
macro_rules! ppu_trace {
    ($($arg:tt)*) => {};
}

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;
pub const FRAME_BYTES: usize = SCREEN_WIDTH * SCREEN_HEIGHT * 4;

// Timing constants in T-cycles
pub const LINE_CYCLES: u32 = 456;
pub const FRAME_CYCLES: u32 = LINE_CYCLES * 154;
const MODE2_CYCLES: u32 = 80;
const MODE3_CYCLES: u32 = 172;
// Mode 3 never runs past cycle 289 of a line.
const MODE3_MAX_EXTEND: u32 = 289 - MODE2_CYCLES - MODE3_CYCLES;

const LAST_LINE: u8 = 153;

const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

const WINDOW_X_MAX: u8 = 166;

// VRAM layout
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;

const MODE_HBLANK: u8 = 0;
const MODE_VBLANK: u8 = 1;
const MODE_OAM: u8 = 2;
const MODE_TRANSFER: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Sprite {
    x: i16,
    y: i16,
    tile: u8,
    flags: u8,
    oam_index: u8,
}

/// Registers captured when pixel transfer starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LineRegs {
    lcdc: u8,
    scy: u8,
    scx: u8,
    wy: u8,
    wx: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
}

impl LineRegs {
    fn capture(bus: &Bus) -> Self {
        Self {
            lcdc: bus.reg(IoReg::Lcdc),
            scy: bus.reg(IoReg::Scy),
            scx: bus.reg(IoReg::Scx),
            wy: bus.reg(IoReg::Wy),
            wx: bus.reg(IoReg::Wx),
            bgp: bus.reg(IoReg::Bgp),
            obp0: bus.reg(IoReg::Obp0),
            obp1: bus.reg(IoReg::Obp1),
        }
    }

    fn apply(&mut self, change: &ScanlineChange) {
        match change.reg {
            LatchedReg::Bgp => self.bgp = change.value,
            LatchedReg::Obp0 => self.obp0 = change.value,
            LatchedReg::Obp1 => self.obp1 = change.value,
            LatchedReg::BgEnable => self.lcdc = (self.lcdc & !0x01) | (change.value & 0x01),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BgPixel {
    color_id: u8,
    palette: u8,
    priority: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ObjPixel {
    /// 0 means no sprite covers the pixel.
    color_id: u8,
    /// CGB palette number, or the OBP register (0/1) on DMG.
    palette: u8,
    behind_bg: bool,
}

fn blank_frame() -> Vec<u8> {
    vec![0xFF; FRAME_BYTES]
}

#[inline]
fn rgb_to_rgba(rgb: u32) -> [u8; 4] {
    [(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8, 0xFF]
}

/// Converts a BGR555 colour to RGBA8.
pub fn decode_cgb_color(raw: u16) -> [u8; 4] {
    let expand = |c: u16| {
        let c = (c & 0x1F) as u8;
        (c << 3) | (c >> 2)
    };
    [expand(raw), expand(raw >> 5), expand(raw >> 10), 0xFF]
}

#[inline]
fn dmg_shade(palette: u8, color_id: u8) -> u8 {
    (palette >> (color_id * 2)) & 0x03
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ppu {
    cgb: bool,
    mode: u8,
    /// Cycles into the current line.
    clock: u32,
    mode3_extend: u32,
    window_line: u8,
    stat_line: bool,
    lcd_on: bool,
    line_regs: LineRegs,
    line_sprites: Vec<Sprite>,
    dmg_shades: [[u8; 4]; 4],
    frames: u64,
    #[serde(skip, default = "blank_frame")]
    front: Vec<u8>,
    #[serde(skip, default = "blank_frame")]
    back: Vec<u8>,
    ready_to_draw: bool,
    resized: bool,
}

impl Ppu {
    /// `dmg_palette` holds four 0xRRGGBB shades from lightest to darkest.
    pub fn new(cgb: bool, dmg_palette: [u32; 4]) -> Self {
        Self {
            cgb,
            mode: MODE_HBLANK,
            clock: 0,
            mode3_extend: 0,
            window_line: 0,
            stat_line: false,
            lcd_on: false,
            line_regs: LineRegs::default(),
            line_sprites: Vec::with_capacity(MAX_SPRITES_PER_LINE),
            dmg_shades: dmg_palette.map(rgb_to_rgba),
            frames: 0,
            front: blank_frame(),
            back: blank_frame(),
            ready_to_draw: false,
            resized: true,
        }
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn window_line(&self) -> u8 {
        self.window_line
    }

    /// Frames completed since power on.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn screen_data(&self) -> &[u8] {
        &self.front
    }

    pub fn is_ready_to_draw(&self) -> bool {
        self.ready_to_draw
    }

    pub fn clear_ready_to_draw(&mut self) {
        self.ready_to_draw = false;
    }

    pub fn is_resized(&self) -> bool {
        self.resized
    }

    pub fn clear_resized(&mut self) {
        self.resized = false;
    }

    fn mode3_cycles(&self) -> u32 {
        MODE3_CYCLES + self.mode3_extend
    }

    fn mode_end(&self) -> u32 {
        match self.mode {
            MODE_OAM => MODE2_CYCLES,
            MODE_TRANSFER => MODE2_CYCLES + self.mode3_cycles(),
            _ => LINE_CYCLES,
        }
    }

    pub fn update(&mut self, cycles: u32, bus: &mut Bus) {
        if bus.reg(IoReg::Lcdc) & 0x80 == 0 {
            if self.lcd_on {
                self.turn_off(bus);
            }
            return;
        }
        if !self.lcd_on {
            self.lcd_on = true;
            self.clock = 0;
            self.window_line = 0;
            bus.set_reg(IoReg::Ly, 0);
            self.enter_mode(MODE_OAM, bus);
        }

        self.refresh_coincidence(bus);
        self.update_stat_irq(bus);

        let mut remaining = cycles;
        while remaining > 0 {
            let end = self.mode_end();
            let step = remaining.min(end - self.clock);
            self.clock += step;
            remaining -= step;
            if self.clock >= end {
                self.finish_mode(bus);
            }
        }

        if self.mode == MODE_TRANSFER {
            let drawn = (self.clock - MODE2_CYCLES) * SCREEN_WIDTH as u32 / self.mode3_cycles();
            bus.cur_scanline_x = drawn.min(SCREEN_WIDTH as u32 - 1) as u8;
        }
    }

    fn turn_off(&mut self, bus: &mut Bus) {
        self.lcd_on = false;
        self.clock = 0;
        self.window_line = 0;
        self.stat_line = false;
        self.mode = MODE_HBLANK;
        bus.set_reg(IoReg::Ly, 0);
        *bus.reg_mut(IoReg::Stat) &= !0x03;
        bus.oam_accessible = true;
        bus.vram_accessible = true;
        bus.clear_scanline_changes();
        let blank = self.blank_color(bus);
        for px in self.front.chunks_exact_mut(4) {
            px.copy_from_slice(&blank);
        }
        self.back.copy_from_slice(&self.front);
        self.ready_to_draw = true;
        ppu_trace!("LCD off");
    }

    fn blank_color(&self, bus: &Bus) -> [u8; 4] {
        if self.cgb && !bus.dmg_compat() {
            [0xFF; 4]
        } else {
            self.dmg_shades[0]
        }
    }

    fn enter_mode(&mut self, mode: u8, bus: &mut Bus) {
        self.mode = mode;
        let stat = bus.reg_mut(IoReg::Stat);
        *stat = (*stat & !0x03) | mode;
        match mode {
            MODE_OAM => {
                bus.oam_accessible = false;
                bus.vram_accessible = true;
            }
            MODE_TRANSFER => {
                bus.oam_accessible = false;
                bus.vram_accessible = !bus.strict_vram_timing();
            }
            _ => {
                bus.oam_accessible = true;
                bus.vram_accessible = true;
            }
        }
    }

    fn finish_mode(&mut self, bus: &mut Bus) {
        match self.mode {
            MODE_OAM => {
                self.oam_scan(bus);
                self.line_regs = LineRegs::capture(bus);
                self.mode3_extend = self.compute_mode3_extend();
                bus.clear_scanline_changes();
                bus.cur_scanline_x = 0;
                self.enter_mode(MODE_TRANSFER, bus);
            }
            MODE_TRANSFER => {
                self.render_line(bus);
                bus.clear_scanline_changes();
                self.enter_mode(MODE_HBLANK, bus);
                bus.hdma_hblank_transfer();
            }
            MODE_HBLANK => {
                self.clock = 0;
                let ly = bus.reg(IoReg::Ly) + 1;
                bus.set_reg(IoReg::Ly, ly);
                if ly as usize == SCREEN_HEIGHT {
                    self.enter_mode(MODE_VBLANK, bus);
                    bus.request_interrupt(INT_VBLANK);
                    std::mem::swap(&mut self.front, &mut self.back);
                    self.ready_to_draw = true;
                    self.frames += 1;
                    ppu_trace!("frame {} complete", self.frames);
                } else {
                    self.enter_mode(MODE_OAM, bus);
                }
            }
            _ => {
                self.clock = 0;
                let ly = bus.reg(IoReg::Ly);
                if ly >= LAST_LINE {
                    bus.set_reg(IoReg::Ly, 0);
                    self.window_line = 0;
                    self.enter_mode(MODE_OAM, bus);
                } else {
                    bus.set_reg(IoReg::Ly, ly + 1);
                }
            }
        }
        self.refresh_coincidence(bus);
        self.update_stat_irq(bus);
    }

    fn refresh_coincidence(&self, bus: &mut Bus) {
        let equal = bus.reg(IoReg::Ly) == bus.reg(IoReg::Lyc);
        let stat = bus.reg_mut(IoReg::Stat);
        if equal {
            *stat |= 0x04;
        } else {
            *stat &= !0x04;
        }
    }

    fn update_stat_irq(&mut self, bus: &mut Bus) {
        let stat = bus.reg(IoReg::Stat);
        let coincidence = stat & 0x04 != 0 && stat & 0x40 != 0;
        let mode_signal = match self.mode {
            MODE_HBLANK => stat & 0x08 != 0,
            MODE_VBLANK => stat & 0x10 != 0,
            MODE_OAM => stat & 0x20 != 0,
            _ => false,
        };
        let line = coincidence || mode_signal;
        if line && !self.stat_line {
            bus.request_interrupt(INT_STAT);
        }
        self.stat_line = line;
    }

    /// Collect up to 10 sprites visible on the current scanline.
    fn oam_scan(&mut self, bus: &Bus) {
        let lcdc = bus.reg(IoReg::Lcdc);
        let ly = bus.reg(IoReg::Ly) as i16;
        let sprite_height: i16 = if lcdc & 0x04 != 0 { 16 } else { 8 };
        let oam = bus.oam();
        self.line_sprites.clear();
        for i in 0..TOTAL_SPRITES {
            if self.line_sprites.len() >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = oam[base] as i16 - 16;
            if ly >= y && ly < y + sprite_height {
                self.line_sprites.push(Sprite {
                    x: oam[base + 1] as i16 - 8,
                    y,
                    tile: oam[base + 2],
                    flags: oam[base + 3],
                    oam_index: i as u8,
                });
            }
        }
        if self.cgb && !bus.dmg_compat() {
            self.line_sprites.sort_by_key(|s| s.oam_index);
        } else {
            self.line_sprites.sort_by_key(|s| (s.x, s.oam_index));
        }
    }

    fn compute_mode3_extend(&self) -> u32 {
        let mut extend = (self.line_regs.scx % 8) as u32;
        if self.line_regs.lcdc & 0x02 != 0 {
            extend += 6 * self.line_sprites.len() as u32;
            if let Some(min_x) = self.line_sprites.iter().map(|s| s.x).min()
                && min_x < 0
            {
                extend += (-min_x).min(5) as u32;
            }
        }
        extend.min(MODE3_MAX_EXTEND)
    }

    fn fetch_bg_pixel(vram: &[u8], lcdc: u8, map_base: usize, px: u8, py: u8, cgb: bool) -> BgPixel {
        let map_idx = map_base + (py as usize / 8) * 32 + px as usize / 8;
        let tile = vram[map_idx];
        let attr = if cgb {
            vram[VRAM_BANK_SIZE + map_idx]
        } else {
            0
        };
        let mut row = py as usize % 8;
        let mut bit = 7 - px % 8;
        if attr & 0x20 != 0 {
            bit = px % 8;
        }
        if attr & 0x40 != 0 {
            row = 7 - row;
        }
        let tile_base = if lcdc & 0x10 != 0 {
            tile as usize * 16
        } else {
            (0x1000 + tile as i8 as isize * 16) as usize
        };
        let bank = if attr & 0x08 != 0 { VRAM_BANK_SIZE } else { 0 };
        let addr = bank + tile_base + row * 2;
        let lo = vram[addr];
        let hi = vram[addr + 1];
        BgPixel {
            color_id: (((hi >> bit) & 1) << 1) | ((lo >> bit) & 1),
            palette: attr & 0x07,
            priority: attr & 0x80 != 0,
        }
    }

    fn render_line(&mut self, bus: &Bus) {
        let ly = bus.reg(IoReg::Ly) as usize;
        if ly >= SCREEN_HEIGHT {
            return;
        }
        let regs = self.line_regs;
        let vram = bus.vram();
        let compat = bus.dmg_compat();
        let cgb = self.cgb && !compat;

        // DMG BG enable is resolved per pixel during compositing.
        let mut bg = [BgPixel::default(); SCREEN_WIDTH];
        let map = if regs.lcdc & 0x08 != 0 {
            BG_MAP_1_BASE
        } else {
            BG_MAP_0_BASE
        };
        let y = (ly as u8).wrapping_add(regs.scy);
        for (x, pixel) in bg.iter_mut().enumerate() {
            let px = (x as u8).wrapping_add(regs.scx);
            *pixel = Self::fetch_bg_pixel(vram, regs.lcdc, map, px, y, cgb);
        }

        if (cgb || regs.lcdc & 0x01 != 0)
            && regs.lcdc & 0x20 != 0
            && ly as u8 >= regs.wy
            && regs.wx <= WINDOW_X_MAX
        {
            let map = if regs.lcdc & 0x40 != 0 {
                BG_MAP_1_BASE
            } else {
                BG_MAP_0_BASE
            };
            let start = regs.wx as i16 - 7;
            let wy = self.window_line;
            for x in start.max(0) as usize..SCREEN_WIDTH {
                let wx = (x as i16 - start) as u8;
                bg[x] = Self::fetch_bg_pixel(vram, regs.lcdc, map, wx, wy, cgb);
            }
            self.window_line = self.window_line.wrapping_add(1);
        }

        let mut obj = [ObjPixel::default(); SCREEN_WIDTH];
        if regs.lcdc & 0x02 != 0 {
            let sprite_height: i16 = if regs.lcdc & 0x04 != 0 { 16 } else { 8 };
            for s in &self.line_sprites {
                let mut tile = s.tile;
                if sprite_height == 16 {
                    tile &= 0xFE;
                }
                let mut row = ly as i16 - s.y;
                if s.flags & 0x40 != 0 {
                    row = sprite_height - 1 - row;
                }
                let bank = if cgb && s.flags & 0x08 != 0 {
                    VRAM_BANK_SIZE
                } else {
                    0
                };
                let addr = bank + tile as usize * 16 + row as usize * 2;
                let lo = vram[addr];
                let hi = vram[addr + 1];
                for px in 0..8u8 {
                    let sx = s.x + px as i16;
                    if !(0..SCREEN_WIDTH as i16).contains(&sx) || obj[sx as usize].color_id != 0 {
                        continue;
                    }
                    let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                    let color_id = (((hi >> bit) & 1) << 1) | ((lo >> bit) & 1);
                    if color_id == 0 {
                        continue;
                    }
                    obj[sx as usize] = ObjPixel {
                        color_id,
                        palette: if cgb { s.flags & 0x07 } else { (s.flags >> 4) & 0x01 },
                        behind_bg: s.flags & 0x80 != 0,
                    };
                }
            }
        }

        // Palettes and BG enable are resolved per pixel so mid-line writes
        // only affect pixels from their x onward.
        let changes = bus.scanline_changes();
        let mut cur = regs;
        let mut next_change = 0;
        let mut line = [[0u8; 4]; SCREEN_WIDTH];
        for (x, out) in line.iter_mut().enumerate() {
            while next_change < changes.len() && changes[next_change].x as usize <= x {
                cur.apply(&changes[next_change]);
                next_change += 1;
            }
            let b = bg[x];
            let o = obj[x];
            *out = if cgb {
                let master = cur.lcdc & 0x01 != 0;
                let obj_wins = o.color_id != 0
                    && (!master || b.color_id == 0 || (!b.priority && !o.behind_bg));
                if obj_wins {
                    decode_cgb_color(bus.obj_palettes.color(o.palette as usize, o.color_id as usize))
                } else {
                    decode_cgb_color(bus.bg_palettes.color(b.palette as usize, b.color_id as usize))
                }
            } else {
                let bg_id = if cur.lcdc & 0x01 != 0 { b.color_id } else { 0 };
                let obj_wins = o.color_id != 0 && !(o.behind_bg && bg_id != 0);
                if obj_wins {
                    let obp = if o.palette == 1 { cur.obp1 } else { cur.obp0 };
                    let shade = dmg_shade(obp, o.color_id);
                    if compat {
                        decode_cgb_color(bus.obj_palettes.color(o.palette as usize, shade as usize))
                    } else {
                        self.dmg_shades[shade as usize]
                    }
                } else {
                    let shade = dmg_shade(cur.bgp, bg_id);
                    if compat {
                        decode_cgb_color(bus.bg_palettes.color(0, shade as usize))
                    } else {
                        self.dmg_shades[shade as usize]
                    }
                }
            };
        }

        let row = &mut self.back[ly * SCREEN_WIDTH * 4..(ly + 1) * SCREEN_WIDTH * 4];
        for (dst, px) in row.chunks_exact_mut(4).zip(line.iter()) {
            dst.copy_from_slice(px);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREY: [u32; 4] = [0xFFFFFF, 0xAAAAAA, 0x555555, 0x000000];

    fn lcd_on_bus() -> Bus {
        let mut bus = Bus::new(false);
        bus.write(0xFF40, 0x91);
        bus.write(0xFF47, 0xE4);
        bus
    }

    #[test]
    fn cgb_color_expands_five_bits() {
        assert_eq!(decode_cgb_color(0x7FFF), [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(decode_cgb_color(0x001F), [0xFF, 0x00, 0x00, 0xFF]);
        assert_eq!(decode_cgb_color(0x0001), [0x08, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn mode_sequence_within_a_line() {
        let mut bus = lcd_on_bus();
        let mut ppu = Ppu::new(false, GREY);
        ppu.update(4, &mut bus);
        assert_eq!(ppu.mode(), MODE_OAM);
        assert!(!bus.oam_accessible);
        ppu.update(80, &mut bus);
        assert_eq!(ppu.mode(), MODE_TRANSFER);
        ppu.update(MODE3_CYCLES, &mut bus);
        assert_eq!(ppu.mode(), MODE_HBLANK);
        assert!(bus.oam_accessible);
        ppu.update(LINE_CYCLES - 256, &mut bus);
        assert_eq!(bus.reg(IoReg::Ly), 1);
        assert_eq!(ppu.mode(), MODE_OAM);
    }

    #[test]
    fn scx_and_sprites_extend_mode3() {
        let mut bus = lcd_on_bus();
        bus.write(0xFF40, 0x93);
        bus.write(0xFF43, 3);
        // Two sprites on line 0, one partially off the left edge.
        bus.write(0xFE00, 16);
        bus.write(0xFE01, 4);
        bus.write(0xFE04, 16);
        bus.write(0xFE05, 40);
        let mut ppu = Ppu::new(false, GREY);
        ppu.update(MODE2_CYCLES, &mut bus);
        assert_eq!(ppu.mode(), MODE_TRANSFER);
        assert_eq!(ppu.mode3_cycles(), MODE3_CYCLES + 3 + 12 + 4);
    }

    #[test]
    fn lyc_match_raises_stat_once() {
        let mut bus = lcd_on_bus();
        bus.write(0xFF45, 2);
        bus.write(0xFF41, 0x40);
        let mut ppu = Ppu::new(false, GREY);
        ppu.update(LINE_CYCLES * 2 + 4, &mut bus);
        assert_ne!(bus.reg(IoReg::If) & INT_STAT, 0);
        assert_ne!(bus.read(0xFF41) & 0x04, 0);
        *bus.reg_mut(IoReg::If) &= !INT_STAT;
        ppu.update(100, &mut bus);
        assert_eq!(bus.reg(IoReg::If) & INT_STAT, 0);
    }

    #[test]
    fn lcd_off_blanks_and_resets() {
        let mut bus = lcd_on_bus();
        let mut ppu = Ppu::new(false, GREY);
        ppu.update(LINE_CYCLES * 3 + 100, &mut bus);
        bus.write(0xFF40, 0x11);
        ppu.update(4, &mut bus);
        assert_eq!(bus.reg(IoReg::Ly), 0);
        assert_eq!(bus.read(0xFF41) & 0x03, 0);
        assert!(ppu.is_ready_to_draw());
        assert!(ppu.screen_data().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn window_counter_only_advances_when_drawn() {
        let mut bus = lcd_on_bus();
        bus.write(0xFF40, 0xB1);
        bus.write(0xFF4A, 10);
        bus.write(0xFF4B, 7);
        let mut ppu = Ppu::new(false, GREY);
        ppu.update(LINE_CYCLES * 12, &mut bus);
        assert_eq!(ppu.window_line(), 2);
    }
}
