use tether_plugin::probe;

fn main() {
    tether_plugin::main(probe::spec("sandbox_probe_net", true), probe::handle)
}
