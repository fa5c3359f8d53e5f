use gbemu_core::bus::{Bus, INT_VBLANK, IoReg};
use gbemu_core::ppu::{FRAME_CYCLES, LINE_CYCLES, Ppu, SCREEN_WIDTH};

const GREY: [u32; 4] = [0xFFFFFF, 0xAAAAAA, 0x555555, 0x000000];
const WHITE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const LIGHT: [u8; 4] = [0xAA, 0xAA, 0xAA, 0xFF];
const BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xFF];

const VBLANK_DOTS: u32 = LINE_CYCLES * 144;

/// Fills a tile in the 0x8000 block with one colour index.
fn fill_tile(bus: &mut Bus, tile: u16, color_id: u8) {
    let lo = if color_id & 1 != 0 { 0xFF } else { 0x00 };
    let hi = if color_id & 2 != 0 { 0xFF } else { 0x00 };
    let base = 0x8000 + tile * 16;
    for row in 0..8 {
        bus.write(base + row * 2, lo);
        bus.write(base + row * 2 + 1, hi);
    }
}

fn pixel(ppu: &Ppu, x: usize, y: usize) -> [u8; 4] {
    let off = (y * SCREEN_WIDTH + x) * 4;
    let mut out = [0; 4];
    out.copy_from_slice(&ppu.screen_data()[off..off + 4]);
    out
}

#[test]
fn mid_scanline_palette_write_splits_the_line() {
    let mut bus = Bus::new(false);
    fill_tile(&mut bus, 0, 3);
    bus.write(0xFF47, 0xE4);
    bus.write(0xFF40, 0x91);
    let mut ppu = Ppu::new(false, GREY);

    ppu.update(120, &mut bus);
    assert_eq!(ppu.mode(), 3);
    let split = bus.cur_scanline_x as usize;
    assert_eq!(split, 37);
    bus.write(0xFF47, 0x00);

    ppu.update(VBLANK_DOTS - 120, &mut bus);
    assert!(ppu.is_ready_to_draw());
    for x in 0..split {
        assert_eq!(pixel(&ppu, x, 0), BLACK, "x={x}");
    }
    for x in split..SCREEN_WIDTH {
        assert_eq!(pixel(&ppu, x, 0), WHITE, "x={x}");
    }
    // Later lines latch the new value from the start.
    assert_eq!(pixel(&ppu, 0, 1), WHITE);
}

#[test]
fn mid_scanline_bg_enable_shows_tiles_from_its_x() {
    let mut bus = Bus::new(false);
    fill_tile(&mut bus, 0, 3);
    bus.write(0xFF47, 0xE4);
    bus.write(0xFF40, 0x90);
    let mut ppu = Ppu::new(false, GREY);

    ppu.update(120, &mut bus);
    let split = bus.cur_scanline_x as usize;
    bus.write(0xFF40, 0x91);

    ppu.update(VBLANK_DOTS - 120, &mut bus);
    for x in 0..split {
        assert_eq!(pixel(&ppu, x, 0), WHITE, "x={x}");
    }
    for x in split..SCREEN_WIDTH {
        assert_eq!(pixel(&ppu, x, 0), BLACK, "x={x}");
    }
    assert_eq!(pixel(&ppu, 0, 1), BLACK);
}

fn sprite_over_bg(flags: u8) -> Ppu {
    let mut bus = Bus::new(false);
    fill_tile(&mut bus, 0, 1);
    fill_tile(&mut bus, 1, 3);
    bus.write(0xFE00, 16);
    bus.write(0xFE01, 8);
    bus.write(0xFE02, 1);
    bus.write(0xFE03, flags);
    bus.write(0xFF47, 0xE4);
    bus.write(0xFF48, 0xE4);
    bus.write(0xFF40, 0x93);
    let mut ppu = Ppu::new(false, GREY);
    ppu.update(VBLANK_DOTS, &mut bus);
    ppu
}

#[test]
fn sprite_draws_over_background() {
    let ppu = sprite_over_bg(0x00);
    for x in 0..8 {
        assert_eq!(pixel(&ppu, x, 0), BLACK);
    }
    assert_eq!(pixel(&ppu, 8, 0), LIGHT);
    assert_eq!(pixel(&ppu, 0, 8), LIGHT);
}

#[test]
fn behind_bg_sprite_hides_under_nonzero_background() {
    let ppu = sprite_over_bg(0x80);
    for x in 0..8 {
        assert_eq!(pixel(&ppu, x, 0), LIGHT);
    }
}

#[test]
fn cgb_background_uses_palette_ram() {
    let mut bus = Bus::new(true);
    bus.write(0xFF68, 0x80);
    bus.write(0xFF69, 0x1F);
    bus.write(0xFF69, 0x00);
    bus.write(0xFF40, 0x91);
    let mut ppu = Ppu::new(true, GREY);
    ppu.update(VBLANK_DOTS, &mut bus);
    assert_eq!(pixel(&ppu, 0, 0), [0xFF, 0x00, 0x00, 0xFF]);
    assert_eq!(pixel(&ppu, 159, 143), [0xFF, 0x00, 0x00, 0xFF]);
}

#[test]
fn vblank_cadence_is_exact() {
    let mut bus = Bus::new(false);
    bus.write(0xFF40, 0x91);
    let mut ppu = Ppu::new(false, GREY);

    let mut dots = 0u32;
    let mut hits = Vec::new();
    while hits.len() < 3 {
        ppu.update(4, &mut bus);
        dots += 4;
        if bus.reg(IoReg::If) & INT_VBLANK != 0 {
            hits.push(dots);
            *bus.reg_mut(IoReg::If) &= !INT_VBLANK;
        }
    }
    assert_eq!(
        hits,
        vec![VBLANK_DOTS, VBLANK_DOTS + FRAME_CYCLES, VBLANK_DOTS + 2 * FRAME_CYCLES]
    );
    assert_eq!(ppu.frames(), 3);
}
