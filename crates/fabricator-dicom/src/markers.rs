//! 图像识别标记
//!
//! 每个检查随机选择两个图形、两个字母（A–J）和两个数字，打乱顺序后画在每张图像上，
//! 同时把说明文字附加到检查描述中，便于人工核对图像是否对应。

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 可绘制的图形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Triangle,
    Star,
    Circle,
    Moon,
    Square,
    Pentagon,
    Octagon,
}

impl Shape {
    pub const ALL: [Shape; 7] = [
        Shape::Triangle,
        Shape::Star,
        Shape::Circle,
        Shape::Moon,
        Shape::Square,
        Shape::Pentagon,
        Shape::Octagon,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Shape::Triangle => "triangle",
            Shape::Star => "star",
            Shape::Circle => "circle",
            Shape::Moon => "moon",
            Shape::Square => "square",
            Shape::Pentagon => "pentagon",
            Shape::Octagon => "octagon",
        }
    }
}

/// 单个标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Marker {
    Shape(Shape),
    Letter(char),
    Digit(char),
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Shape(shape) => f.write_str(shape.name()),
            Marker::Letter(c) | Marker::Digit(c) => write!(f, "{}", c),
        }
    }
}

/// 一个检查使用的标记集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    /// 随机选择：2个图形 + 2个字母 + 2个数字，打乱顺序
    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let letters: Vec<char> = ('A'..='J').collect();
        let digits: Vec<char> = ('0'..='9').collect();

        let mut markers: Vec<Marker> = Shape::ALL
            .choose_multiple(rng, 2)
            .map(|s| Marker::Shape(*s))
            .collect();
        markers.extend(letters.choose_multiple(rng, 2).map(|c| Marker::Letter(*c)));
        markers.extend(digits.choose_multiple(rng, 2).map(|c| Marker::Digit(*c)));
        markers.shuffle(rng);

        Self { markers }
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// `Image: triangle, A, 5, ...`
    pub fn description(&self) -> String {
        let names: Vec<String> = self.markers.iter().map(|m| m.to_string()).collect();
        format!("Image: {}", names.join(", "))
    }
}
