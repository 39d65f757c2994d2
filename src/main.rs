use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use space_to_batch::builders::{
    make_binary, make_broadcast, make_convolve, make_reduce, make_reduce_window, make_zero,
};
use space_to_batch::common::{DimSize, Dtype, Shape};
use space_to_batch::hlo::{BinaryOp, Computation, Module, Reducer};
use space_to_batch::pass::HloPass;
use space_to_batch::pprint::{pprint, PrintMode};
use space_to_batch::space_to_batch::{ConverterConfig, ConvolutionSpaceToBatchConverter};
use space_to_batch::window::{ConvDimensionNumbers, Window, WindowDimension};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print mode
    #[arg(long, value_enum, default_value_t = PrintMode::Full)]
    print_mode: PrintMode,

    #[arg(long, short, default_value = "1")]
    batch: DimSize,
    #[arg(long, default_value = "16")]
    width: DimSize,
    #[arg(long, default_value = "4")]
    channels: DimSize,
    #[arg(long, default_value = "8")]
    filters: DimSize,
    #[arg(long, default_value = "3")]
    kernel: DimSize,
    #[arg(long, default_value = "1")]
    stride: DimSize,
    /// Low and high padding of the convolution along its width
    #[arg(long, num_args = 2, default_values_t = [1, 1])]
    padding: Vec<DimSize>,

    /// Consumer of the convolution's output
    #[arg(long, value_enum, default_value_t = Consumer::Relu)]
    consumer: Consumer,

    /// Convolutions with a larger batch are not rewritten
    #[arg(long, default_value = "1")]
    limit: DimSize,
    #[arg(long, default_value = "8")]
    new_batch_size: DimSize,

    /// Compare the rewritten computation against the original on random
    /// inputs
    #[arg(long)]
    verify: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
enum Consumer {
    None,
    Relu,
    Sum,
    MaxPool,
}

fn build_computation(args: &Args) -> Result<Computation> {
    let mut c = Computation::new("main");
    let input = c.add_parameter(Shape::new(
        Dtype::Float32,
        [args.batch, 1, args.width, args.channels],
    ));
    let filter = c.add_parameter(Shape::new(
        Dtype::Float32,
        [1, args.kernel, args.channels, args.filters],
    ));
    let window = Window::new([
        WindowDimension::new(1),
        WindowDimension::new(args.kernel)
            .with_stride(args.stride)
            .with_padding(args.padding[0], args.padding[1]),
    ]);
    let conv = make_convolve(
        &mut c,
        input,
        filter,
        1,
        1,
        window,
        ConvDimensionNumbers::channels_last(2),
    )
    .context("convolution is malformed")?;

    let conv_dims = c.shape(conv).dims.to_vec();
    let zero = make_zero(&mut c, Dtype::Float32);
    let root = match args.consumer {
        Consumer::None => conv,
        Consumer::Relu => {
            let zeros = make_broadcast(&mut c, zero, &[], &conv_dims)?;
            make_binary(&mut c, BinaryOp::Maximum, conv, zeros)?
        }
        Consumer::Sum => make_reduce(&mut c, conv, zero, &[0, 2], Reducer::Add)?,
        Consumer::MaxPool => {
            let window = Window::new([
                WindowDimension::new(1),
                WindowDimension::new(1),
                WindowDimension::new(3).with_stride(2).with_padding(0, 1),
                WindowDimension::new(1),
            ]);
            make_reduce_window(&mut c, conv, zero, window, Reducer::Maximum)?
        }
    };
    c.set_root(root);
    Ok(c)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let before = build_computation(&args)?;
    pprint(&before, args.print_mode);
    println!();

    let mut module = Module::new("demo");
    module.add_computation(before.clone());
    let converter = ConvolutionSpaceToBatchConverter::new(ConverterConfig {
        limit_on_batch_size: args.limit,
        new_batch_size: args.new_batch_size,
        ..ConverterConfig::default()
    });
    let start_time = std::time::Instant::now();
    let changed = converter.run(&mut module)?;
    info!("{} took {:?}", converter.name(), start_time.elapsed());

    let after = module.computation(0);
    pprint(after, args.print_mode);
    println!("Rewritten: {changed}");

    if args.verify {
        verify(&before, after)?;
    }
    Ok(())
}

#[cfg(feature = "verification")]
fn verify(before: &Computation, after: &Computation) -> Result<()> {
    let difference = space_to_batch::verification::max_abs_difference(before, after, 0)?;
    println!("Largest difference: {difference}");
    Ok(())
}

#[cfg(not(feature = "verification"))]
fn verify(_before: &Computation, _after: &Computation) -> Result<()> {
    anyhow::bail!("built without the verification feature")
}
