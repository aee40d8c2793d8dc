//! 機械学習モデルの共通定義
//!
//! 手書き英大文字（1文字）分類用のCNNモデルと関連する設定を提供します。
//! アンサンブルの全メンバーがこの同じ構成を使います。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig, PRelu, PReluConfig,
        PaddingConfig2d,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

/// クラス数（A〜Z）
pub const NUM_CLASSES: usize = 26;

/// 入力画像サイズ
pub const IMAGE_SIZE: usize = 32;

/// 各畳み込み段の出力チャネル数
pub const CONV_CHANNELS: [usize; 3] = [32, 64, 128];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = 26)]
    pub num_classes: usize,
    /// ドロップアウト率（学習時のみ有効）
    #[config(default = 0.2)]
    pub dropout: f64,
    /// 畳み込みカーネルのL2正則化係数
    #[config(default = 0.001)]
    pub l2_penalty: f64,
    /// PReLUの負側の傾きの初期値
    #[config(default = 0.0)]
    pub prelu_alpha: f64,
}

impl ModelConfig {
    /// 平坦化後の特徴次元
    ///
    /// - Conv1 (same) 32x32 -> Pool 16x16
    /// - Conv2 (same) 16x16 -> Pool 8x8
    /// - Conv3 (valid) 8x8 -> 6x6 -> Pool 3x3
    pub fn feature_dim() -> usize {
        let after_stage1 = IMAGE_SIZE / 2;
        let after_stage2 = after_stage1 / 2;
        let after_stage3 = (after_stage2 - 2) / 2;
        CONV_CHANNELS[2] * after_stage3 * after_stage3
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> CharClassifier<B> {
        let [c1, c2, c3] = CONV_CHANNELS;
        let d = Self::feature_dim();

        CharClassifier {
            conv1: conv3x3(1, c1, PaddingConfig2d::Same, device),
            act1: self.prelu(c1, device),
            conv2: conv3x3(c1, c2, PaddingConfig2d::Same, device),
            act2: self.prelu(c2, device),
            conv3: conv3x3(c2, c3, PaddingConfig2d::Valid, device),
            act3: self.prelu(c3, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            fc1: LinearConfig::new(d, 128).init(device),
            act4: self.prelu(128, device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(128, 64).init(device),
            act5: self.prelu(64, device),
            fc3: LinearConfig::new(64, self.num_classes).init(device),

            l2_penalty: self.l2_penalty,
        }
    }

    fn prelu<B: Backend>(&self, channels: usize, device: &B::Device) -> PRelu<B> {
        PReluConfig::new()
            .with_num_parameters(channels)
            .with_alpha(self.prelu_alpha)
            .init(device)
    }
}

/// 3x3 畳み込み（He正規分布で初期化）
fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    padding: PaddingConfig2d,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([1, 1])
        .with_padding(padding)
        .with_initializer(Initializer::KaimingNormal {
            gain: std::f64::consts::SQRT_2,
            fan_out_only: false,
        })
        .init(device)
}

/// 手書き文字分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 + PReLU + MaxPool 2x2} x 3段（32 -> 64 -> 128 チャネル、3段目のみpadding無し）
/// - Flatten
/// - FC: 1152 -> 128 + PReLU + Dropout
/// - FC: 128 -> 64 + PReLU
/// - FC: 64 -> num_classes
/// - Softmax (確率出力時)
#[derive(Module, Debug)]
pub struct CharClassifier<B: Backend> {
    conv1: Conv2d<B>,  // 1 -> 32
    act1: PRelu<B>,
    conv2: Conv2d<B>,  // 32 -> 64
    act2: PRelu<B>,
    conv3: Conv2d<B>,  // 64 -> 128
    act3: PRelu<B>,
    pool: MaxPool2d,   // 2x2

    // 全結合層
    fc1: Linear<B>,
    act4: PRelu<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    act5: PRelu<B>,
    fc3: Linear<B>,

    l2_penalty: f64,
}

impl<B: Backend> CharClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 32, 32]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.act1.forward(x);
        let x = self.pool.forward(x);

        let x = self.conv2.forward(x);
        let x = self.act2.forward(x);
        let x = self.pool.forward(x);

        let x = self.conv3.forward(x);
        let x = self.act3.forward(x);
        let x = self.pool.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.act4.forward(x);
        let x = self.dropout.forward(x);

        let x = self.fc2.forward(x);
        let x = self.act5.forward(x);

        self.fc3.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]（各行の和は1）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 畳み込みカーネルのL2正則化項
    pub fn l2_regularization(&self) -> Tensor<B, 1> {
        let squared = |conv: &Conv2d<B>| conv.weight.val().powf_scalar(2.0).sum();
        (squared(&self.conv1) + squared(&self.conv2) + squared(&self.conv3)).mul_scalar(self.l2_penalty)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失はスパースなクロスエントロピーにL2正則化項を加えたものです。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());
        let loss = loss + self.l2_regularization();

        ClassificationOutput::new(loss, output, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_dim() {
        assert_eq!(ModelConfig::feature_dim(), 128 * 3 * 3);
    }

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::zeros([2, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        let output = model.forward(input);
        assert_eq!(output.dims(), [2, NUM_CLASSES]);
    }

    #[test]
    fn test_probabilities_are_normalized() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [3, 1, IMAGE_SIZE, IMAGE_SIZE],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let probs = model
            .forward_probabilities(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        for row in probs.chunks(NUM_CLASSES) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn test_l2_regularization_is_positive() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let penalty = model
            .l2_regularization()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(penalty.len(), 1);
        assert!(penalty[0] > 0.0);
    }
}
