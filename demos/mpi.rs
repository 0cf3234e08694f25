//! Two-rank ghost-zone exchange over a periodic row of four blocks.
//!
//! ```sh
//! mpirun -n 2 cargo run --features mpi --example mpi
//! ```

use mpi::traits::Communicator;

use meshforest::{
    receive_boundary_buffers, send_boundary_buffers, set_boundaries, FieldDescriptor, Mesh,
    Metadata, MetadataFlag, MpiTransport, ParameterInput, TaskStatus,
};

const INPUT: &str = "
<parthenon/mesh>
nx1 = 16
nx2 = 4
ix1_bc = periodic
ox1_bc = periodic

<parthenon/meshblock>
nx1 = 4
nx2 = 4
";

fn main() {
    let mut universe = mpi::initialize().unwrap();
    // Room for one exchange's worth of buffered sends.
    universe.set_buffer_size(1 << 20);
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    if size != 2 {
        panic!("run this demo on exactly 2 ranks, not {size}");
    }

    let pin: ParameterInput = INPUT.parse().unwrap();
    let fields = vec![FieldDescriptor::new(
        "rho",
        Metadata::new().with(MetadataFlag::FillGhost),
    )];
    let mut mesh = Mesh::from_input_on_rank(&pin, fields, rank, size).unwrap();
    mesh.attach_transport(MpiTransport::new(&world)).unwrap();

    println!(
        "rank {rank}: owns blocks {:?}",
        mesh.blocks().iter().map(|b| b.gid()).collect::<Vec<_>>()
    );

    // Rank 0 marks block 0; every block then shows the marker in exactly
    // the ghosts facing it.
    if let Some(block) = mesh.block_mut(0) {
        let bounds = *block.cellbounds();
        let data = block.field_mut("rho").unwrap().data_mut().unwrap();
        for j in bounds.interior(1).s..=bounds.interior(1).e {
            for i in bounds.interior(0).s..=bounds.interior(0).e {
                data[[0, 0, j as usize, i as usize]] = 1.0;
            }
        }
    }

    send_boundary_buffers(&mut mesh).unwrap();
    while receive_boundary_buffers(&mut mesh).unwrap() == TaskStatus::Incomplete {}
    set_boundaries(&mut mesh).unwrap();

    for block in mesh.blocks() {
        let bounds = *block.cellbounds();
        let data = block.field("rho").unwrap().data().unwrap();
        let j = bounds.interior(1).s as usize;
        println!(
            "rank {rank} block {}: west ghost {}, east ghost {}",
            block.gid(),
            data[[0, 0, j, 0]],
            data[[0, 0, j, (bounds.interior(0).e + 1) as usize]],
        );
    }
}
