//! One ghost-zone exchange cycle over a periodic row of blocks, driven
//! through a task list.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example exchange
//! ```

use meshforest::{
    receive_boundary_buffers, send_boundary_buffers, set_boundaries, FieldDescriptor, Mesh,
    Metadata, MetadataFlag, ParameterInput, TaskList,
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
    env_logger::init();

    let pin: ParameterInput = INPUT.parse().expect("valid input");
    let fields = vec![FieldDescriptor::new(
        "rho",
        Metadata::new().with(MetadataFlag::FillGhost),
    )];
    let mut mesh = Mesh::from_input(&pin, fields).expect("valid mesh");

    // Put a marker value into block 0's interior.
    {
        let block = mesh.block_mut(0).expect("block 0 is local");
        let bounds = *block.cellbounds();
        let data = block
            .field_mut("rho")
            .expect("rho declared")
            .data_mut()
            .expect("rho is dense");
        for j in bounds.interior(1).s..=bounds.interior(1).e {
            for i in bounds.interior(0).s..=bounds.interior(0).e {
                data[[0, 0, j as usize, i as usize]] = 1.0;
            }
        }
    }

    let mut tasks: TaskList<Mesh> = TaskList::new();
    let send = tasks.add_task("send_bounds", &[], send_boundary_buffers);
    let recv = tasks.add_task("recv_bounds", &[send], receive_boundary_buffers);
    tasks.add_task("set_bounds", &[recv], set_boundaries);
    tasks.execute(&mut mesh).expect("exchange cycle");

    for block in mesh.blocks() {
        let bounds = *block.cellbounds();
        let data = block.field("rho").unwrap().data().unwrap();
        let j = bounds.interior(1).s as usize;
        let west: Vec<_> = (0..bounds.nghost())
            .map(|i| data[[0, 0, j, i as usize]])
            .collect();
        let east: Vec<_> = (0..bounds.nghost())
            .map(|i| data[[0, 0, j, (bounds.interior(0).e + 1 + i) as usize]])
            .collect();
        println!(
            "block {}: west ghosts {:?}, east ghosts {:?}",
            block.gid(),
            west,
            east
        );
    }
}
