//! 元数据图像渲染
//!
//! 在8位灰度画布上绘制：标题、免责声明、逐行元数据、序列/图像编号、识别标记和页脚。
//! 文本使用8x8点阵字体，按字符格换行；超长单词拆分到下一行，保证每个值完整显示。
//! 换行不增删任何字符，去掉续行缩进后按顺序拼接即得到原文。

use crate::glyphs::{glyph, REPLACEMENT};
use crate::markers::{Marker, MarkerSet, Shape};
use crate::metadata::MetadataRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fabricator_core::config::RenderingConfig;
use fabricator_core::{FabricatorError, Result};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use std::io::Cursor;
use tracing::debug;

pub const TITLE: &str = "DICOM TEST IMAGE - NOT FOR CLINICAL USE";
pub const DISCLAIMERS: [&str; 2] = [
    "Metadata shown below correct at time of generation",
    "PACS and integrations may change the dicom tags to contain different data than displayed here",
];

const GLYPH: u32 = 8;
const LINE_HEIGHT: u32 = 11;
const MARGIN: u32 = 16;
const MARKER_CELL: u32 = 56;
const MARKER_GAP: u32 = 16;
/// 元数据续行缩进，与 `(GGGG,EEEE) ` 前缀对齐
const CONTINUATION_INDENT: usize = 12;

const WHITE: Luma<u8> = Luma([255]);
const BLACK: Luma<u8> = Luma([0]);
const GREY: Luma<u8> = Luma([128]);

/// 渲染结果
///
/// `pixels` 是原样嵌入DICOM的规范像素缓冲区（行优先，每像素1字节）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// 按绘制顺序排列的文本行
    pub lines: Vec<String>,
}

impl RenderedImage {
    /// PNG + Base64 编码，供显示端使用
    pub fn to_base64_png(&self) -> Result<String> {
        let image = GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| FabricatorError::Render("pixel buffer does not match image size".to_string()))?;
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(image)
            .write_to(&mut png, ImageFormat::Png)
            .map_err(|e| FabricatorError::Render(format!("PNG encoding failed: {}", e)))?;
        Ok(STANDARD.encode(png.into_inner()))
    }
}

/// 元数据图像合成器
#[derive(Debug, Clone)]
pub struct ImageSynthesizer {
    size: u32,
    footer: String,
}

impl ImageSynthesizer {
    pub fn new(config: &RenderingConfig) -> Self {
        Self {
            size: config.canvas_size,
            footer: config.footer_text.clone(),
        }
    }

    /// 每行可容纳的字符数
    pub fn columns(&self) -> usize {
        ((self.size - 2 * MARGIN) / GLYPH) as usize
    }

    /// 元数据区可容纳的行数
    pub fn metadata_capacity(&self) -> usize {
        let top = self.metadata_top();
        let bottom = self.bottom_separator();
        (bottom.saturating_sub(top + 4) / LINE_HEIGHT) as usize
    }

    /// 元数据换行后的文本行
    pub fn metadata_lines(&self, record: &MetadataRecord) -> Vec<String> {
        record
            .displayed()
            .flat_map(|entry| wrap_text(&entry.display_line(), self.columns(), CONTINUATION_INDENT))
            .collect()
    }

    /// 在写任何文件之前确认记录能完整画在画布上
    pub fn check_fits(&self, record: &MetadataRecord) -> Result<()> {
        let needed = self.metadata_lines(record).len();
        let capacity = self.metadata_capacity();
        if needed > capacity {
            return Err(FabricatorError::Validation(format!(
                "metadata needs {} lines but a {}x{} image holds {}; shorten the study or series description",
                needed, self.size, self.size, capacity
            )));
        }
        Ok(())
    }

    // 标题和免责声明之后的第一行
    fn metadata_top(&self) -> u32 {
        let disclaimer_lines: usize = DISCLAIMERS
            .iter()
            .map(|d| wrap_text(d, self.columns(), 0).len())
            .sum();
        MARGIN + LINE_HEIGHT + 4 + disclaimer_lines as u32 * LINE_HEIGHT + 4 + 8
    }

    fn footer_y(&self) -> u32 {
        self.size.saturating_sub(MARGIN + GLYPH)
    }

    fn marker_top(&self) -> u32 {
        self.footer_y().saturating_sub(16 + MARKER_CELL)
    }

    fn series_y(&self) -> u32 {
        self.marker_top().saturating_sub(12 + 2 * GLYPH)
    }

    fn bottom_separator(&self) -> u32 {
        self.series_y().saturating_sub(10)
    }

    /// 渲染一张图像
    pub fn render(
        &self,
        record: &MetadataRecord,
        markers: &MarkerSet,
        series_number: u32,
        instance_number: u32,
    ) -> Result<RenderedImage> {
        let size = self.size;
        let columns = self.columns();
        let mut canvas = GrayImage::new(size, size);
        let mut lines = Vec::new();

        draw_hollow_rect_mut(&mut canvas, Rect::at(4, 4).of_size(size - 8, size - 8), WHITE);

        // 标题（加粗）
        let mut y = MARGIN;
        self.draw_centered(&mut canvas, y, TITLE, 1, WHITE, true);
        lines.push(TITLE.to_string());
        y += LINE_HEIGHT + 4;

        for disclaimer in DISCLAIMERS {
            for line in wrap_text(disclaimer, columns, 0) {
                self.draw_centered(&mut canvas, y, &line, 1, WHITE, false);
                lines.push(line);
                y += LINE_HEIGHT;
            }
        }
        y += 4;
        self.separator(&mut canvas, y);
        y += 8;

        // 底部区域从下往上定位
        let footer_y = self.footer_y();
        let marker_top = self.marker_top();
        let series_y = self.series_y();
        let bottom_separator = self.bottom_separator();

        let metadata = self.metadata_lines(record);
        if metadata.len() > self.metadata_capacity() {
            return Err(FabricatorError::Render(format!(
                "{} metadata lines do not fit on a {}x{} canvas",
                metadata.len(),
                size,
                size
            )));
        }
        for line in metadata {
            draw_text(&mut canvas, MARGIN, y, &line, 1, WHITE);
            lines.push(line);
            y += LINE_HEIGHT;
        }

        self.separator(&mut canvas, bottom_separator);
        let label = format!("Series {} Image {}", series_number, instance_number);
        self.draw_centered(&mut canvas, series_y, &label, 2, WHITE, false);
        lines.push(label);

        self.draw_markers(&mut canvas, markers, marker_top);

        for line in wrap_text(&self.footer, columns, 0) {
            self.draw_centered(&mut canvas, footer_y, &line, 1, GREY, false);
            lines.push(line);
        }

        debug!("Rendered series {} image {} ({} text lines)", series_number, instance_number, lines.len());
        Ok(RenderedImage {
            width: size,
            height: size,
            pixels: canvas.into_raw(),
            lines,
        })
    }

    fn separator(&self, canvas: &mut GrayImage, y: u32) {
        draw_line_segment_mut(
            canvas,
            (MARGIN as f32, y as f32),
            ((self.size - MARGIN) as f32, y as f32),
            WHITE,
        );
    }

    fn draw_centered(&self, canvas: &mut GrayImage, y: u32, text: &str, scale: u32, color: Luma<u8>, bold: bool) {
        let width = text.chars().count() as u32 * GLYPH * scale;
        let x = self.size.saturating_sub(width) / 2;
        draw_text(canvas, x, y, text, scale, color);
        if bold {
            draw_text(canvas, x + 1, y, text, scale, color);
        }
    }

    fn draw_markers(&self, canvas: &mut GrayImage, markers: &MarkerSet, top: u32) {
        let count = markers.markers().len() as u32;
        if count == 0 {
            return;
        }
        let row_width = count * MARKER_CELL + (count - 1) * MARKER_GAP;
        let mut x = self.size.saturating_sub(row_width) / 2;

        for marker in markers.markers() {
            let cx = (x + MARKER_CELL / 2) as i32;
            let cy = (top + MARKER_CELL / 2) as i32;
            let radius = (MARKER_CELL / 2 - 6) as i32;
            match marker {
                Marker::Shape(shape) => draw_shape(canvas, *shape, cx, cy, radius),
                Marker::Letter(c) | Marker::Digit(c) => {
                    draw_hollow_rect_mut(canvas, Rect::at(x as i32, top as i32).of_size(MARKER_CELL, MARKER_CELL), WHITE);
                    let scale = 4;
                    let offset = (MARKER_CELL - GLYPH * scale) / 2;
                    draw_text(canvas, x + offset, top + offset, &c.to_string(), scale, WHITE);
                }
            }
            x += MARKER_CELL + MARKER_GAP;
        }
    }
}

fn draw_shape(canvas: &mut GrayImage, shape: Shape, cx: i32, cy: i32, radius: i32) {
    use std::f64::consts::{FRAC_PI_2, PI};

    match shape {
        Shape::Circle => draw_filled_circle_mut(canvas, (cx, cy), radius, WHITE),
        Shape::Moon => {
            draw_filled_circle_mut(canvas, (cx, cy), radius, WHITE);
            draw_filled_circle_mut(canvas, (cx + radius / 2, cy - radius / 4), radius, BLACK);
        }
        Shape::Square => {
            let side = (radius * 3 / 2) as u32;
            let half = (side / 2) as i32;
            draw_filled_rect_mut(canvas, Rect::at(cx - half, cy - half).of_size(side, side), WHITE);
        }
        Shape::Triangle => draw_polygon_mut(canvas, &regular_polygon(cx, cy, radius, 3, -FRAC_PI_2), WHITE),
        Shape::Pentagon => draw_polygon_mut(canvas, &regular_polygon(cx, cy, radius, 5, -FRAC_PI_2), WHITE),
        Shape::Octagon => draw_polygon_mut(canvas, &regular_polygon(cx, cy, radius, 8, PI / 8.0), WHITE),
        Shape::Star => {
            let points: Vec<Point<i32>> = (0..10)
                .map(|i| {
                    let r = if i % 2 == 0 { radius as f64 } else { radius as f64 * 0.45 };
                    let angle = -FRAC_PI_2 + i as f64 * PI / 5.0;
                    Point::new(cx + (r * angle.cos()).round() as i32, cy + (r * angle.sin()).round() as i32)
                })
                .collect();
            draw_polygon_mut(canvas, &points, WHITE);
        }
    }
}

fn regular_polygon(cx: i32, cy: i32, radius: i32, sides: u32, rotation: f64) -> Vec<Point<i32>> {
    (0..sides)
        .map(|i| {
            let angle = rotation + i as f64 * 2.0 * std::f64::consts::PI / sides as f64;
            Point::new(
                cx + (radius as f64 * angle.cos()).round() as i32,
                cy + (radius as f64 * angle.sin()).round() as i32,
            )
        })
        .collect()
}

/// 用8x8点阵字体绘制一行文本；字体中没有的字符显示为 `?`
pub fn draw_text(canvas: &mut GrayImage, x: u32, y: u32, text: &str, scale: u32, color: Luma<u8>) {
    let (width, height) = canvas.dimensions();
    for (index, c) in text.chars().enumerate() {
        let glyph = glyph(c).or_else(|| glyph(REPLACEMENT)).unwrap_or([0; 8]);
        let origin_x = x + index as u32 * GLYPH * scale;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH {
                if bits & (1 << col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = origin_x + col * scale + dx;
                        let py = y + row as u32 * scale + dy;
                        if px < width && py < height {
                            canvas.put_pixel(px, py, color);
                        }
                    }
                }
            }
        }
    }
}

/// 按字符数换行
///
/// 第一行从第0列开始，续行以 `indent` 个空格开头。优先在空格后断行，断点处的空格留在上一行末尾；
/// 单词超过剩余宽度时拆分。不截断、不合并空白。
pub fn wrap_text(text: &str, width: usize, indent: usize) -> Vec<String> {
    let width = width.max(2);
    let indent = indent.min(width / 2);
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut len = 0;
    let mut empty = true;

    for piece in text.split_inclusive(' ') {
        let mut rest: Vec<char> = piece.chars().collect();
        while !rest.is_empty() {
            if len + rest.len() <= width {
                len += rest.len();
                line.extend(rest.drain(..));
                empty = false;
            } else if !empty {
                lines.push(std::mem::replace(&mut line, " ".repeat(indent)));
                len = indent;
                empty = true;
            } else {
                let room = width - len;
                line.extend(rest.drain(..room));
                lines.push(std::mem::replace(&mut line, " ".repeat(indent)));
                len = indent;
            }
        }
    }
    if !empty || lines.is_empty() {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::{sample_record, sample_record_described};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // 去掉续行缩进后拼回原文
    fn unwrap_lines(lines: &[String], indent: usize) -> String {
        lines
            .iter()
            .enumerate()
            .map(|(i, l)| if i == 0 { l.as_str() } else { &l[indent..] })
            .collect()
    }

    #[test]
    fn test_wrap_respects_width() {
        let text = "(0020,000D) Study Instance UID: 1.2.826.0.1.3680043.9.7382.1736938200123456.42.987654";
        let lines = wrap_text(text, 40, 12);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.chars().count() <= 40), "{:?}", lines);
        assert!(lines[1..].iter().all(|l| l.starts_with(&" ".repeat(12))));
        assert_eq!(unwrap_lines(&lines, 12), text);
    }

    #[test]
    fn test_wrap_splits_long_words() {
        let word = "X".repeat(130);
        let lines = wrap_text(&word, 60, 12);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 60);
        assert_eq!(unwrap_lines(&lines, 12), word);
    }

    #[test]
    fn test_wrap_short_and_empty() {
        assert_eq!(wrap_text("Modality: DX", 60, 12), vec!["Modality: DX"]);
        assert_eq!(wrap_text("", 60, 12), vec![String::new()]);
    }

    #[test]
    fn test_wrap_preserves_spacing_exactly() {
        let text = "(0008,103E) Series Description: Chest  PA   with   extra   spacing and a few more words to wrap";
        let lines = wrap_text(text, 40, 12);
        assert!(lines.len() > 2);
        assert!(lines.iter().all(|l| l.chars().count() <= 40), "{:?}", lines);
        assert_eq!(unwrap_lines(&lines, 12), text);
    }

    #[test]
    fn test_render_contains_every_value() {
        let record = sample_record();
        let synthesizer = ImageSynthesizer::new(&RenderingConfig::default());
        let markers = MarkerSet::choose(&mut StdRng::seed_from_u64(1));
        let image = synthesizer.render(&record, &markers, 2, 3).unwrap();

        assert_eq!(image.width, 512);
        assert_eq!(image.pixels.len(), 512 * 512);
        assert_eq!(image.lines[0], TITLE);
        assert!(image.lines.contains(&"Series 2 Image 3".to_string()));

        // 逐条核对：每个显示条目的换行结果原样出现在图像文本行中
        let columns = synthesizer.columns();
        for entry in record.displayed() {
            let wrapped = wrap_text(&entry.display_line(), columns, CONTINUATION_INDENT);
            assert_eq!(unwrap_lines(&wrapped, CONTINUATION_INDENT), entry.display_line());
            let found = image.lines.windows(wrapped.len()).any(|w| w == wrapped.as_slice());
            assert!(found, "missing {}", entry.name);
        }
        assert!(image.lines.iter().all(|l| l.chars().count() <= synthesizer.columns()));
    }

    #[test]
    fn test_overlong_record_rejected_before_rendering() {
        let synthesizer = ImageSynthesizer::new(&RenderingConfig::default());
        let record = sample_record();
        synthesizer.check_fits(&record).unwrap();
        assert!(synthesizer.metadata_lines(&record).len() <= synthesizer.metadata_capacity());

        let long = sample_record_described(&"Chest radiograph two views ".repeat(40));
        assert!(matches!(synthesizer.check_fits(&long), Err(FabricatorError::Validation(_))));
        let markers = MarkerSet::choose(&mut StdRng::seed_from_u64(4));
        assert!(matches!(synthesizer.render(&long, &markers, 1, 1), Err(FabricatorError::Render(_))));
    }

    #[test]
    fn test_non_ascii_text_is_drawn() {
        let mut plain = GrayImage::new(64, 8);
        let mut accented = GrayImage::new(64, 8);
        let mut unknown = GrayImage::new(64, 8);
        let mut question = GrayImage::new(64, 8);
        draw_text(&mut plain, 0, 0, "E", 1, WHITE);
        draw_text(&mut accented, 0, 0, "É", 1, WHITE);
        draw_text(&mut unknown, 0, 0, "王", 1, WHITE);
        draw_text(&mut question, 0, 0, "?", 1, WHITE);
        assert_ne!(plain, accented);
        assert!(accented.pixels().any(|p| *p == WHITE));
        assert_eq!(unknown, question);
    }

    #[test]
    fn test_render_draws_text_and_footer() {
        let record = sample_record();
        let synthesizer = ImageSynthesizer::new(&RenderingConfig::default());
        let markers = MarkerSet::choose(&mut StdRng::seed_from_u64(2));
        let image = synthesizer.render(&record, &markers, 1, 1).unwrap();

        assert!(image.pixels.iter().any(|p| *p == 255));
        assert!(image.pixels.iter().any(|p| *p == 128));
        assert!(image.pixels.iter().filter(|p| **p == 0).count() > image.pixels.len() / 2);
    }

    #[test]
    fn test_render_is_deterministic() {
        let record = sample_record();
        let synthesizer = ImageSynthesizer::new(&RenderingConfig::default());
        let markers = MarkerSet::choose(&mut StdRng::seed_from_u64(3));
        assert_eq!(
            synthesizer.render(&record, &markers, 1, 1).unwrap(),
            synthesizer.render(&record, &markers, 1, 1).unwrap()
        );
    }

    #[test]
    fn test_base64_png() {
        let image = RenderedImage {
            width: 4,
            height: 2,
            pixels: vec![0, 64, 128, 255, 255, 128, 64, 0],
            lines: Vec::new(),
        };
        let encoded = image.to_base64_png().unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(&decoded[1..4], b"PNG");

        let broken = RenderedImage {
            pixels: vec![0; 3],
            ..image
        };
        assert!(broken.to_base64_png().is_err());
    }
}
